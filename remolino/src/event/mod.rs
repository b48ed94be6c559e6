use bitflags::bitflags;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::task::Waker;

pub(crate) mod timer;
pub(crate) use timer::{TimerEvent, TimerKind};

/// Identifier of one pending suspension condition.
///
/// Ids come from a single process-wide counter so they stay unique across
/// loops; an id doubles as the cancellation key for bound pairs, and a key
/// that could alias between two reactors would make `trigger_bound` from a
/// foreign thread ambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

impl EventId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an I/O waiter is waiting for on its descriptor.
///
/// Accept shares the read side and connect the write side of the poll
/// interest; the distinction only matters to the awaiter's first-poll probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
    Accept,
    Connect,
}

impl Direction {
    pub(crate) fn side(self) -> Side {
        match self {
            Direction::Read | Direction::Accept => Side::In,
            Direction::Write | Direction::Connect => Side::Out,
        }
    }
}

/// Poll interest side a direction collapses onto. Used as a queue index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    In = 0,
    Out = 1,
}

bitflags! {
    /// Outcome bits the reactor stamps onto a waiter before resuming it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u8 {
        /// The condition was satisfied (set on every delivery).
        const READY = 1 << 0;
        /// The descriptor was torn down while the waiter was queued.
        const CLOSED = 1 << 1;
        /// The waiter lost a bound race; its sibling fired first.
        const INTERRUPTED = 1 << 2;
    }
}

/// Shared outcome cell between one event record and its awaiter.
///
/// The reactor writes, the awaiter reads after being woken. Atomic because a
/// user event can be triggered (and stamped) from a foreign thread.
#[derive(Debug, Default)]
pub struct FlagCell(AtomicU8);

impl FlagCell {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU8::new(0)))
    }

    pub(crate) fn insert(&self, flags: EventFlags) {
        self.0.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn get(&self) -> EventFlags {
        EventFlags::from_bits_truncate(self.0.load(Ordering::Acquire))
    }
}

/// The continuation half of an event record: the waker to resume plus the
/// outcome cell the resumed awaiter will inspect.
#[derive(Debug)]
pub(crate) struct Waiter {
    waker: Waker,
    flags: Arc<FlagCell>,
}

impl Waiter {
    pub(crate) fn new(waker: Waker, flags: Arc<FlagCell>) -> Self {
        Self { waker, flags }
    }

    /// Stamp outcome bits without resuming. Used by `remove_all_io`, where
    /// the wake happens inline rather than through a `wait` batch.
    pub(crate) fn wake(self, extra: EventFlags) {
        self.flags.insert(EventFlags::READY | extra);
        self.waker.wake();
    }
}

/// One ready event handed from `Reactor::wait` to the event loop.
///
/// The loop owns it for exactly one resumption; dropping it without calling
/// `resume` would strand the waiter, so the worker drains every batch it is
/// given in order.
#[derive(Debug)]
pub(crate) struct Ready {
    id: EventId,
    waiter: Waiter,
    extra: EventFlags,
}

impl Ready {
    pub(crate) fn new(id: EventId, waiter: Waiter, extra: EventFlags) -> Self {
        Self { id, waiter, extra }
    }

    pub(crate) fn id(&self) -> EventId {
        self.id
    }

    pub(crate) fn resume(self) {
        self.waiter.wake(self.extra);
    }
}

/// A task waiting on descriptor readiness. Queued FIFO per `(fd, side)`.
#[derive(Debug)]
pub(crate) struct IoEvent {
    pub(crate) id: EventId,
    pub(crate) fd: RawFd,
    pub(crate) direction: Direction,
    pub(crate) waiter: Waiter,
}

/// Where the cancellable sibling of a bound pair is queued.
///
/// `Timer` exists only to be rejected: a timer is cancellable solely as the
/// *trigger* side of a pair, never as the sibling. Collaborators depend on
/// that asymmetry, so it is a fatal error rather than a missing variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BoundSlot {
    Io { fd: RawFd, direction: Direction },
    User,
    Timer,
}

/// What fires the cancelling side of a bound pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    Timer,
    User,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock_waker;

    #[test]
    fn test_event_ids_are_unique_and_increasing() {
        let a = EventId::next();
        let b = EventId::next();
        let c = EventId::next();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_direction_collapses_onto_poll_sides() {
        assert_eq!(Direction::Read.side(), Side::In);
        assert_eq!(Direction::Accept.side(), Side::In);
        assert_eq!(Direction::Write.side(), Side::Out);
        assert_eq!(Direction::Connect.side(), Side::Out);
    }

    #[test]
    fn test_flag_cell_accumulates_bits() {
        let flags = FlagCell::new();
        flags.insert(EventFlags::READY);
        flags.insert(EventFlags::INTERRUPTED);
        let got = flags.get();
        assert!(got.contains(EventFlags::READY | EventFlags::INTERRUPTED));
        assert!(!got.contains(EventFlags::CLOSED));
    }

    #[test]
    fn test_ready_resume_stamps_before_waking() {
        let (waker, count) = mock_waker();
        let flags = FlagCell::new();
        let ready = Ready::new(
            EventId::next(),
            Waiter::new(waker, flags.clone()),
            EventFlags::INTERRUPTED,
        );
        ready.resume();
        assert_eq!(count.wakes(), 1);
        assert!(flags.get().contains(EventFlags::READY | EventFlags::INTERRUPTED));
    }
}
