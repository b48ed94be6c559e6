use crate::task::harness::JoinCore;
use crate::task::{Id, JoinError};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// An owned permission to join on a task (await its termination).
///
/// The equivalent of [`std::thread::JoinHandle`] for a task rather than a
/// thread. The task starts running when spawned, whether or not the handle
/// is ever awaited.
///
/// Awaiting the handle suspends the awaiter until the task finishes and
/// yields its value, or the failure it captured: a panic inside the task
/// arrives here as [`JoinError`] and can be re-raised with
/// [`JoinError::into_panic`].
///
/// Dropping the handle *detaches* the task: it keeps running, its value is
/// discarded, and a captured failure is reported to the diagnostic sink
/// since nobody is left to observe it.
pub struct JoinHandle<T> {
    raw: Arc<dyn JoinCore<T>>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(raw: Arc<dyn JoinCore<T>>) -> Self {
        Self { raw }
    }

    pub fn id(&self) -> Id {
        self.raw.id()
    }
}

impl<T> Unpin for JoinHandle<T> {}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.raw.poll_join(cx)
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        self.raw.detach();
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle").field("id", &self.id()).finish()
    }
}
