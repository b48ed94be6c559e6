use crate::task::Id;
use parking_lot::Mutex;

/// Call-by-call introspection on a scheduler, recorded during tests and
/// compiled to nothing in release builds. Small price to pay to be able to
/// assert on release/unhandled-failure bookkeeping from the outside.
#[derive(Debug, Default)]
#[allow(unused)]
pub(crate) struct Tracker {
    calls: Mutex<Vec<Call>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(unused)]
pub(crate) enum Call {
    Spawn { id: Id },
    Schedule { id: Id },
    Release { id: Id },
    UnhandledFailure { id: Id },
}

#[allow(unused)]
impl Tracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub(crate) fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| matches(call)).count()
    }
}
