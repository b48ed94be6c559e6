use crate::runtime::{AddMode, Schedule};
use crate::task::{Header, Id, JoinError, Task};
use parking_lot::{Mutex, MutexGuard};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Type-erased face of a task cell, what the run queue and owned-task map
/// hold.
pub(crate) trait Harness: Send + Sync + 'static {
    fn header(&self) -> &Header;

    /// Poll the wrapped future once, driving the state machine.
    fn run(self: Arc<Self>);

    /// Cancel without polling: drop the future, leave a cancelled result
    /// for a joiner that may still arrive. Owner-thread only, and never
    /// while the task is mid-poll.
    fn shutdown(self: Arc<Self>);
}

/// Type-erased face the `JoinHandle` holds: same cell, narrowed to the
/// output type.
pub(crate) trait JoinCore<T>: Send + Sync {
    fn poll_join(&self, cx: &mut Context<'_>) -> Poll<Result<T, JoinError>>;

    /// The handle went away; failures with nobody left to observe them go
    /// to the diagnostic sink.
    fn detach(&self);

    fn id(&self) -> Id;
}

/// Where a task's future lives across its lifetime. `Pending` until the
/// body finishes, `Finished` while a result waits for its joiner,
/// `Consumed` once taken (or when there is no joiner to take it).
enum Stage<F: Future> {
    Pending(F),
    Finished(Result<F::Output, JoinError>),
    Consumed,
}

struct Core<F: Future> {
    stage: Stage<F>,
    join_waker: Option<Waker>,
}

/// One spawned task: header state machine, scheduler handle, and the future
/// plus its eventual result under a single mutex.
pub(crate) struct Cell<F: Future, S: Schedule> {
    header: Header,
    scheduler: S,
    core: Mutex<Core<F>>,
}

impl<F, S> Cell<F, S>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    S: Schedule,
{
    pub(crate) fn new(future: F, scheduler: S, id: Id) -> Arc<Self> {
        Arc::new(Self {
            header: Header::new(id),
            scheduler,
            core: Mutex::new(Core {
                stage: Stage::Pending(future),
                join_waker: None,
            }),
        })
    }

    fn id(&self) -> Id {
        self.header.id()
    }

    fn wake_inner(self: &Arc<Self>) {
        if self.header.transition_to_scheduled() {
            self.scheduler.schedule(Task::new(self.clone()), AddMode::Fifo);
        }
    }

    fn complete(
        self: &Arc<Self>,
        mut core: MutexGuard<'_, Core<F>>,
        result: Result<F::Output, JoinError>,
    ) {
        self.header.transition_to_complete();
        if self.header.is_detached() {
            if let Err(error) = &result {
                self.scheduler.unhandled_failure(self.id(), error);
            }
            core.stage = Stage::Consumed;
        } else {
            core.stage = Stage::Finished(result);
        }
        let join_waker = core.join_waker.take();
        drop(core);
        if let Some(waker) = join_waker {
            waker.wake();
        }
        self.scheduler.release(self.id());
    }
}

impl<F, S> std::task::Wake for Cell<F, S>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    S: Schedule,
{
    fn wake(self: Arc<Self>) {
        self.wake_inner();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wake_inner();
    }
}

impl<F, S> Harness for Cell<F, S>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    S: Schedule,
{
    fn header(&self) -> &Header {
        &self.header
    }

    fn run(self: Arc<Self>) {
        if !self.header.transition_to_running() {
            return;
        }
        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);

        let mut core = self.core.lock();
        let polled = match &mut core.stage {
            Stage::Pending(future) => {
                // Safety: the future is pinned inside the Arc'd mutex and is
                // only ever dropped in place by a stage replacement.
                let pinned = unsafe { Pin::new_unchecked(future) };
                panic::catch_unwind(AssertUnwindSafe(|| pinned.poll(&mut cx)))
            }
            _ => {
                debug_assert!(false, "running a task with no future");
                return;
            }
        };

        match polled {
            Ok(Poll::Pending) => {
                drop(core);
                if !self.header.transition_to_idle() {
                    // A wake landed mid-poll; run again soon.
                    self.scheduler.schedule(Task::new(self.clone()), AddMode::Lifo);
                }
            }
            Ok(Poll::Ready(value)) => self.complete(core, Ok(value)),
            Err(payload) => {
                let error = JoinError::panic(self.id(), payload);
                self.complete(core, Err(error));
            }
        }
    }

    fn shutdown(self: Arc<Self>) {
        if self.header.is_complete() {
            return;
        }
        self.header.transition_to_complete();
        let mut core = self.core.lock();
        if matches!(core.stage, Stage::Pending(_)) {
            core.stage = if self.header.is_detached() {
                Stage::Consumed
            } else {
                Stage::Finished(Err(JoinError::cancelled(self.id())))
            };
        }
        let join_waker = core.join_waker.take();
        drop(core);
        if let Some(waker) = join_waker {
            waker.wake();
        }
    }
}

impl<F, S> JoinCore<F::Output> for Cell<F, S>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    S: Schedule,
{
    fn poll_join(&self, cx: &mut Context<'_>) -> Poll<Result<F::Output, JoinError>> {
        let mut core = self.core.lock();
        match core.stage {
            Stage::Finished(_) => {
                let Stage::Finished(result) = std::mem::replace(&mut core.stage, Stage::Consumed)
                else {
                    unreachable!()
                };
                Poll::Ready(result)
            }
            Stage::Pending(_) => {
                core.join_waker = Some(cx.waker().clone());
                Poll::Pending
            }
            Stage::Consumed => panic!("JoinHandle polled after completion"),
        }
    }

    fn detach(&self) {
        self.header.detach();
        // A failure that already landed, with its last observer now gone,
        // still reaches the sink.
        let mut core = self.core.lock();
        if matches!(core.stage, Stage::Finished(Err(_))) {
            let Stage::Finished(Err(error)) = std::mem::replace(&mut core.stage, Stage::Consumed)
            else {
                unreachable!()
            };
            drop(core);
            self.scheduler.unhandled_failure(self.header.id(), &error);
        }
    }

    fn id(&self) -> Id {
        self.header.id()
    }
}
