use crate::event::Ready;
use crate::reactor::{Reactor, ReactorError};
use crate::runtime::dispatcher::Inbox;
use crate::runtime::scheduler::Handle;
use crate::runtime::{AddMode, RuntimeConfig};
use crate::task::{Id, Task};
use anyhow::{Context as _, Result, bail};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::pin::pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Drives one thread's poll-resume cycle: drain the inbox, run runnable
/// tasks, poll the root future when woken, sweep finished tasks, reconcile
/// reactor interest, then block in `wait` and resume the delivered batch in
/// order. Interior mutability throughout because the scheduler re-enters
/// the worker (to enqueue) from inside task polls.
#[derive(Debug)]
pub(crate) struct Worker {
    reactor: RefCell<Reactor>,
    /// The run queue. Popped from the front.
    pollable: RefCell<VecDeque<Task>>,
    inbox: Arc<Inbox>,
    batch: RefCell<Vec<Ready>>,
}

impl Worker {
    pub(crate) fn new(cfg: &RuntimeConfig) -> Result<Self, ReactorError> {
        let reactor = Reactor::new(cfg.max_events_per_wait)?;
        let inbox = Inbox::new(reactor.shared());
        Ok(Self {
            reactor: RefCell::new(reactor),
            pollable: RefCell::new(VecDeque::new()),
            inbox,
            batch: RefCell::new(Vec::with_capacity(cfg.max_events_per_wait)),
        })
    }

    pub(crate) fn inbox(&self) -> &Arc<Inbox> {
        &self.inbox
    }

    pub(crate) fn add_task(&self, task: Task, mode: AddMode) {
        let mut queue = self.pollable.borrow_mut();
        match mode {
            AddMode::Fifo => queue.push_back(task),
            AddMode::Lifo => queue.push_front(task),
        }
    }

    fn find_task(&self) -> Option<Task> {
        self.pollable.borrow_mut().pop_front()
    }

    pub(crate) fn with_reactor<R>(&self, f: impl FnOnce(&mut Reactor) -> R) -> R {
        f(&mut self.reactor.borrow_mut())
    }

    /// Drive `future` plus everything spawned onto this loop until the
    /// reactor reports itself idle and the root has produced its value.
    pub(crate) fn block_on<F: Future>(&self, handle: &Handle, future: F) -> Result<F::Output> {
        let mut root = pin!(future);
        let waker = Waker::from(Arc::clone(&handle.0));
        let mut cx = Context::from_waker(&waker);
        let mut root_result: Option<F::Output> = None;

        handle.set_root_woken();
        loop {
            if self.drain_inbox(handle) {
                bail!("event loop was shut down while driving a root future");
            }
            self.run_tasks();

            if handle.reset_root_woken() && root_result.is_none() {
                if let Poll::Ready(value) = root.as_mut().poll(&mut cx) {
                    root_result = Some(value);
                }
            }

            self.sweep(handle);

            let clean = self.with_reactor(|reactor| -> Result<bool, ReactorError> {
                reactor.trim()?;
                Ok(reactor.is_clean())
            })?;

            if !self.pollable.borrow().is_empty() {
                continue;
            }
            if clean && self.inbox.is_empty() && handle.tasks.is_empty() {
                if let Some(value) = root_result.take() {
                    return Ok(value);
                }
                // Root pending with nothing registered that could wake it
                // locally: park on the wake descriptor and wait for a
                // foreign-thread wake (or block forever on a true deadlock,
                // like any join on a task that never finishes).
            }

            self.park(handle)?;
        }
    }

    /// A consumer loop with no root future: stays parked on its wake
    /// descriptor, running dispatched seeds and their tasks, until the
    /// runtime requests shutdown. Remaining tasks are cancelled on the way
    /// out.
    pub(crate) fn run_parked(&self, handle: &Handle) -> Result<()> {
        self.with_reactor(|reactor| reactor.set_permanent(true));
        tracing::debug!(loop_id = %handle.loop_id(), "worker parked");

        loop {
            if self.drain_inbox(handle) {
                break;
            }
            self.run_tasks();
            self.sweep(handle);
            self.with_reactor(|reactor| reactor.trim())
                .context("reactor trim")?;
            if self.pollable.borrow().is_empty() {
                self.park(handle)?;
            }
        }

        self.with_reactor(|reactor| reactor.set_permanent(false));
        for task in handle.tasks.drain_all() {
            task.shutdown();
        }
        self.sweep(handle);
        tracing::debug!(loop_id = %handle.loop_id(), "worker stopped");
        Ok(())
    }

    /// Block in the reactor and resume the delivered batch in order.
    fn park(&self, handle: &Handle) -> Result<()> {
        let mut batch = self.batch.borrow_mut();
        let count = self
            .with_reactor(|reactor| reactor.wait(&mut batch))
            .context("reactor wait")?;
        if count > 0 {
            tracing::trace!(loop_id = %handle.loop_id(), count, "resuming batch");
        }
        for ready in batch.drain(..) {
            ready.resume();
        }
        Ok(())
    }

    /// Returns true when shutdown was requested.
    fn drain_inbox(&self, handle: &Handle) -> bool {
        while let Some(task) = self.inbox.pop_task() {
            self.add_task(task, AddMode::Fifo);
        }
        while let Some(seed) = self.inbox.pop_seed() {
            seed(handle);
        }
        self.inbox.shutdown_requested()
    }

    /// Run what is queued right now; tasks woken by these polls run on the
    /// next loop iteration so timers and I/O keep getting their chance.
    fn run_tasks(&self) {
        let queued = self.pollable.borrow().len();
        for _ in 0..queued {
            match self.find_task() {
                Some(task) => task.run(),
                None => break,
            }
        }
    }

    /// Deferred destruction: drop the owning reference of every task
    /// released since the last pass. Runs only after the resumption batch
    /// has fully returned, never from inside it.
    fn sweep(&self, handle: &Handle) {
        if handle.released.borrow().is_empty() {
            return;
        }
        let released: Vec<Id> = handle.released.borrow_mut().drain(..).collect();
        for id in released {
            handle.tasks.remove(id);
        }
    }
}
