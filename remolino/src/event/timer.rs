use crate::event::{EventId, Waiter};
use std::cmp::Ordering;
use std::time::Instant;

/// A timer heap entry. Either wakes its own waiter when due, or cancels the
/// sibling of a bound pair (the timeout side of an I/O-vs-deadline race).
#[derive(Debug)]
pub(crate) struct TimerEvent {
    pub(crate) id: EventId,
    pub(crate) deadline: Instant,
    /// Insertion order, breaks deadline ties so equal deadlines fire FIFO.
    pub(crate) seq: u64,
    pub(crate) kind: TimerKind,
}

#[derive(Debug)]
pub(crate) enum TimerKind {
    Wake(Waiter),
    Cancel { sibling: EventId },
}

impl PartialEq for TimerEvent {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEvent {}

// BinaryHeap is a max-heap; invert so the earliest deadline surfaces first.
impl Ord for TimerEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
