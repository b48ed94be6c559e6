use crate::task::Id;
use crate::task::harness::Harness;
use std::fmt;
use std::sync::Arc;

/// A shared reference to one task cell. The loop's owned-task map holds one
/// until the release sweep; the run queue holds one per pending resumption.
pub(crate) struct Task {
    raw: Arc<dyn Harness>,
}

impl Task {
    pub(crate) fn new(raw: Arc<dyn Harness>) -> Self {
        Self { raw }
    }

    pub(crate) fn id(&self) -> Id {
        self.raw.header().id()
    }

    pub(crate) fn run(self) {
        self.raw.run();
    }

    pub(crate) fn shutdown(self) {
        self.raw.shutdown();
    }
}

impl Clone for Task {
    fn clone(&self) -> Self {
        Self {
            raw: Arc::clone(&self.raw),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("id", &self.id()).finish()
    }
}
