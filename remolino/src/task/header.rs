use crate::task::Id;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// A task is resumed at most once per wait: wakes against a task that is
/// already queued are dropped here, and wakes that land mid-poll set the
/// notified state so the poller re-queues exactly once.
const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 2;
const NOTIFIED: u8 = 3;
const COMPLETE: u8 = 4;

#[derive(Debug)]
pub(crate) struct Header {
    id: Id,
    state: AtomicU8,
    detached: AtomicBool,
}

impl Header {
    /// Tasks are born scheduled: `spawn` enqueues immediately.
    pub(crate) fn new(id: Id) -> Self {
        Self {
            id,
            state: AtomicU8::new(SCHEDULED),
            detached: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> Id {
        self.id
    }

    /// Wake path. Returns true when the caller must enqueue the task.
    pub(crate) fn transition_to_scheduled(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match current {
                IDLE => SCHEDULED,
                RUNNING => NOTIFIED,
                // Already queued, already notified, or finished.
                SCHEDULED | NOTIFIED | COMPLETE => return false,
                other => unreachable!("invalid task state {other}"),
            };
            match self.state.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next == SCHEDULED,
                Err(actual) => current = actual,
            }
        }
    }

    /// Queue-pop path. False when the task completed or was cancelled while
    /// it sat in the queue.
    pub(crate) fn transition_to_running(&self) -> bool {
        self.state
            .compare_exchange(SCHEDULED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// After a pending poll. True: the task parked. False: a wake landed
    /// mid-poll and the caller must re-queue it.
    pub(crate) fn transition_to_idle(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let (next, parked) = match current {
                RUNNING => (IDLE, true),
                NOTIFIED => (SCHEDULED, false),
                COMPLETE => return true,
                other => unreachable!("invalid task state {other}"),
            };
            match self.state.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return parked,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn transition_to_complete(&self) {
        self.state.store(COMPLETE, Ordering::Release);
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETE
    }

    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_wake_enqueues_once() {
        let header = Header::new(Id::next());
        assert!(header.transition_to_running());
        assert!(header.transition_to_idle());

        assert!(header.transition_to_scheduled());
        assert!(!header.transition_to_scheduled());
    }

    #[test]
    fn test_wake_during_poll_requeues_after_poll() {
        let header = Header::new(Id::next());
        assert!(header.transition_to_running());

        // Wake lands mid-poll: no enqueue now...
        assert!(!header.transition_to_scheduled());
        // ...but the poller learns it must re-queue.
        assert!(!header.transition_to_idle());
        assert!(header.transition_to_running());
    }

    #[test]
    fn test_completed_task_ignores_wakes() {
        let header = Header::new(Id::next());
        assert!(header.transition_to_running());
        header.transition_to_complete();
        assert!(!header.transition_to_scheduled());
        assert!(!header.transition_to_running());
    }
}
