use crate::runtime::Schedule;

mod error;
pub use self::error::JoinError;

mod harness;
pub(crate) use self::harness::Cell;

mod header;
pub(crate) use self::header::Header;

pub mod id;
pub use self::id::Id;

mod join;
pub use self::join::JoinHandle;

pub(crate) mod task;
pub(crate) use self::task::Task;

/// Constructor for a new task. Two references to the underlying cell are
/// created: the `Task` usually goes straight into the loop's owned-task map
/// (and, cloned, into the run queue while a resumption is pending), while
/// the `JoinHandle` is the awaiter's claim on the result. Wakers hold
/// further shared references for as long as event records are pending.
pub(crate) fn new_task<F, S>(future: F, scheduler: S, id: Id) -> (Task, JoinHandle<F::Output>)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    S: Schedule,
{
    let cell = Cell::new(future, scheduler, id);
    (Task::new(cell.clone()), JoinHandle::new(cell))
}
