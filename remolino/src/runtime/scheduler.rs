use crate::reactor::{Notifier, Reactor, ReactorError};
use crate::runtime::dispatcher::{Dispatcher, LoopId, Seed};
use crate::runtime::worker::Worker;
use crate::runtime::{AddMode, RuntimeConfig, Schedule};
use crate::task::{Id, JoinError, JoinHandle, Task, new_task};
#[allow(unused_imports)]
use crate::utils::scheduler::{Call, Tracker};
use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::Deref;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::ThreadId;

/// One event loop's state: the worker (reactor + run queue), the owned-task
/// map, the deferred-release list and the root future's wake flag. Built on
/// the thread that will drive it and pinned there.
#[derive(Debug)]
pub struct Scheduler {
    #[allow(unused)]
    pub(crate) cfg: RuntimeConfig,

    pub(crate) loop_id: LoopId,

    /// The only thread allowed to touch the worker's interior state.
    pub(crate) thread_id: ThreadId,

    pub(crate) worker: Worker,

    pub(crate) tasks: OwnedTasks,

    /// Finished task ids awaiting the sweep pass. Destruction is deferred
    /// because the finishing poll may still be on the stack.
    pub(crate) released: RefCell<Vec<Id>>,

    pub(crate) root_woken: AtomicBool,

    /// Diagnostic-sink counter for detached failures.
    pub(crate) unhandled: AtomicUsize,

    pub(crate) notifier: Notifier,

    pub(crate) dispatcher: Arc<Dispatcher>,

    #[cfg(test)]
    pub(crate) tracker: Tracker,
}

impl Scheduler {
    pub(crate) fn new(
        cfg: &RuntimeConfig,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self, ReactorError> {
        let worker = Worker::new(cfg)?;
        let notifier = worker.with_reactor(|reactor| reactor.notifier());
        Ok(Self {
            cfg: cfg.clone(),
            loop_id: LoopId::next(),
            thread_id: std::thread::current().id(),
            worker,
            tasks: OwnedTasks::new(),
            released: RefCell::new(Vec::new()),
            root_woken: AtomicBool::new(true),
            unhandled: AtomicUsize::new(0),
            notifier,
            dispatcher,

            #[cfg(test)]
            tracker: Tracker::new(),
        })
    }

    pub(crate) fn into_handle(self) -> Handle {
        Handle(Arc::new(self))
    }

    pub(crate) fn set_root_woken(&self) {
        self.root_woken.store(true, Ordering::Release);
    }

    pub(crate) fn reset_root_woken(&self) -> bool {
        self.root_woken.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn on_owner_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    #[cfg(test)]
    fn track(&self, call: Call) {
        self.tracker.record(call);
    }

    #[cfg(not(test))]
    #[inline(always)]
    fn track(&self, _call: Call) {}
}

// Safety: the worker's interior (reactor, run queue, owned tasks, released
// list) is only ever touched on the owning thread; every cross-thread entry
// point goes through the inbox, the notifier tables or plain atomics. We
// don't want thread-safe structures on the single-threaded hot path, so we
// vouch for the split instead.
unsafe impl Send for Scheduler {}
unsafe impl Sync for Scheduler {}

/// Waking the root future: set the flag, and if the wake came from a
/// foreign thread, unpark the loop through its wake descriptor.
impl std::task::Wake for Scheduler {
    fn wake(self: Arc<Self>) {
        Self::wake_by_ref(&self);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.set_root_woken();
        if !self.on_owner_thread() {
            self.worker.inbox().wake();
        }
    }
}

/// A loop's public face: spawn onto it, dispatch away from it, and pass it
/// into suspension primitives as the explicit "current loop" context. There
/// is no thread-local lookup; worker threads receive their handle at
/// startup and tasks capture clones.
#[derive(Debug, Clone)]
pub struct Handle(pub(crate) Arc<Scheduler>);

// Safety: see Scheduler. Cloning and the cross-thread entry points are
// safe anywhere; the owner-thread-only methods assert their thread.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Schedule for Handle {
    fn schedule(&self, task: Task, mode: AddMode) {
        self.track(Call::Schedule { id: task.id() });
        if self.on_owner_thread() {
            self.worker.add_task(task, mode);
        } else {
            // Foreign-thread wake: hand the task to the owner through its
            // inbox and unpark it.
            self.worker.inbox().push_task(task);
        }
    }

    fn release(&self, id: Id) {
        self.track(Call::Release { id });
        self.released.borrow_mut().push(id);
    }

    fn unhandled_failure(&self, id: Id, error: &JoinError) {
        self.track(Call::UnhandledFailure { id });
        self.unhandled.fetch_add(1, Ordering::Relaxed);
        tracing::error!(task = %id, %error, "detached task failed with no awaiter");
    }
}

impl Handle {
    /// Start a task on this loop. Must be called on the loop's own thread;
    /// from anywhere else, hand a seed to [`Handle::dispatch_to`] instead.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        debug_assert!(
            self.on_owner_thread(),
            "spawn must run on the loop's thread; dispatch a seed from outside"
        );
        let id = Id::next();
        self.track(Call::Spawn { id });

        let (task, join_handle) = new_task(future, self.clone(), id);
        let previous = self.tasks.insert(task.clone());
        debug_assert!(previous.is_none());

        self.schedule(task, AddMode::Fifo);

        join_handle
    }

    /// Drive a future to completion on this loop, along with every task
    /// spawned onto it, until the reactor reports itself idle.
    #[track_caller]
    pub(crate) fn block_on<F: Future>(&self, future: F) -> F::Output {
        assert!(
            self.on_owner_thread(),
            "block_on must run on the thread that built the runtime"
        );
        match self.worker.block_on(self, future) {
            Ok(value) => value,
            Err(e) => panic!("failed to drive future to completion: {e:?}"),
        }
    }

    pub fn loop_id(&self) -> LoopId {
        self.loop_id
    }

    /// Cross-thread handle for triggering user events and bound
    /// cancellations against this loop's reactor.
    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    /// Round-robin a seed to a registered consumer loop. Hands the seed
    /// back when no consumer exists.
    pub fn dispatch(&self, seed: Seed) -> Result<LoopId, Seed> {
        self.dispatcher.dispatch(self.loop_id, seed)
    }

    /// Addressed delivery to a specific loop. Hands the seed back when the
    /// id is not currently registered.
    pub fn dispatch_to(&self, target: LoopId, seed: Seed) -> Result<(), Seed> {
        self.dispatcher.dispatch_to(target, seed)
    }

    /// Tear down every pending waiter on a descriptor, resuming each with a
    /// closed signal, before the fd number can be reused.
    pub fn remove_all_io(&self, fd: RawFd) -> Result<usize, ReactorError> {
        debug_assert!(self.on_owner_thread());
        self.worker.with_reactor(|reactor| reactor.remove_all_io(fd))
    }

    /// How many detached-task failures the diagnostic sink has recorded.
    pub fn unhandled_failures(&self) -> usize {
        self.unhandled.load(Ordering::Relaxed)
    }

    pub(crate) fn with_reactor<R>(&self, f: impl FnOnce(&mut Reactor) -> R) -> R {
        debug_assert!(self.on_owner_thread());
        self.worker.with_reactor(f)
    }
}

impl Deref for Handle {
    type Target = Arc<Scheduler>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// The loop's owning references to its live tasks. Entries leave through
/// the sweep pass (deferred release) or runtime shutdown.
#[derive(Debug, Default)]
pub(crate) struct OwnedTasks {
    tasks: RefCell<HashMap<Id, Task>>,
}

impl OwnedTasks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, task: Task) -> Option<Task> {
        self.tasks.borrow_mut().insert(task.id(), task)
    }

    pub(crate) fn remove(&self, id: Id) -> Option<Task> {
        self.tasks.borrow_mut().remove(&id)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    pub(crate) fn drain_all(&self) -> Vec<Task> {
        self.tasks.borrow_mut().drain().map(|(_, task)| task).collect()
    }
}
