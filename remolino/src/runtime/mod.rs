use crate::task::{Id, JoinError, Task};

// Public API
pub mod runtime;
pub use runtime::{Builder, Runtime};

pub(crate) use runtime::RuntimeConfig;

pub mod dispatcher;
pub use dispatcher::{LoopId, Seed};

pub(crate) mod scheduler;
pub use scheduler::Handle;

pub(crate) mod worker;

#[cfg(test)]
mod tests;

/// Scheduler callbacks the task layer drives.
pub(crate) trait Schedule: Send + Sync + Sized + 'static {
    /// A task became runnable; enqueue it on its owning loop.
    fn schedule(&self, task: Task, mode: AddMode);

    /// The task finished; its owning reference may be dropped, but only by
    /// the loop's sweep pass, never from inside the resumption that
    /// finished it.
    fn release(&self, id: Id);

    /// A detached task failed with nobody awaiting it. Must not be dropped
    /// silently.
    fn unhandled_failure(&self, id: Id, error: &JoinError);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum AddMode {
    /// Run after everything already queued.
    Fifo,
    /// Run next.
    Lifo,
}
