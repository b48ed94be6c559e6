use crate::event::{BoundSlot, EventId, Trigger, Waiter};
use crate::reactor::ReactorError;
use nix::errno::Errno;
use nix::sys::eventfd::{EfdFlags, EventFd};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::Arc;

/// The reactor's cross-thread surface: user events, bound-pair bookkeeping
/// and the wake descriptor. Everything else in the reactor belongs to its
/// owning thread; these tables are mutex-guarded because `trigger_user`,
/// `trigger_bound` and dispatcher wakes legally arrive from foreign threads.
pub(crate) struct Shared {
    wakefd: EventFd,
    user: Mutex<UserTable>,
    bound: Mutex<BoundTable>,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("wakefd", &self.wakefd_raw())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct UserTable {
    pending: HashMap<EventId, Waiter>,
    triggered: VecDeque<(EventId, Waiter)>,
}

#[derive(Debug, Default)]
struct BoundTable {
    /// Cancellable-sibling id -> its pair. Natural wins reconcile through
    /// this map.
    by_sibling: HashMap<EventId, BoundPair>,
    /// Reverse lookup: trigger-side id -> sibling id, for `trigger_bound`.
    by_bound: HashMap<EventId, EventId>,
    /// Pairs whose trigger side fired externally, awaiting the owner
    /// thread's next `wait` pass to pop and resume the sibling.
    triggered: VecDeque<BoundPair>,
}

/// One registered race between a cancellable sibling and a trigger side.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BoundPair {
    pub(crate) bound_id: EventId,
    pub(crate) sibling: EventId,
    pub(crate) slot: BoundSlot,
    pub(crate) trigger: Trigger,
}

impl Shared {
    pub(crate) fn new() -> Result<Self, ReactorError> {
        let wakefd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK)
            .map_err(ReactorError::Create)?;
        Ok(Self {
            wakefd,
            user: Mutex::new(UserTable::default()),
            bound: Mutex::new(BoundTable::default()),
        })
    }

    pub(crate) fn wakefd(&self) -> &EventFd {
        &self.wakefd
    }

    pub(crate) fn wakefd_raw(&self) -> RawFd {
        self.wakefd.as_fd().as_raw_fd()
    }

    /// Unblock the owning loop's `wait` call.
    pub(crate) fn wake(&self) {
        if let Err(e) = self.wakefd.arm() {
            // An eventfd counter cannot legitimately fail to increment; this
            // is a scheduler invariant violation, not a transient condition.
            panic!("FATAL: failed to signal reactor wake descriptor: {e}");
        }
    }

    /// Reset the wake counter after `wait` observed it readable.
    pub(crate) fn drain_wake(&self) -> Result<(), ReactorError> {
        let mut value: u64 = 0;
        // Safety: reading 8 bytes into an owned, aligned u64 from an fd we
        // hold open for the lifetime of this struct.
        let rc = unsafe {
            libc::read(
                self.wakefd_raw(),
                (&raw mut value).cast::<libc::c_void>(),
                size_of::<u64>(),
            )
        };
        if rc >= 0 {
            return Ok(());
        }
        match Errno::last() {
            // A racing pass already consumed the counter.
            Errno::EAGAIN => Ok(()),
            e => Err(ReactorError::WakeFd(e)),
        }
    }

    pub(crate) fn register_user(&self, waiter: Waiter) -> EventId {
        let id = EventId::next();
        self.user.lock().pending.insert(id, waiter);
        id
    }

    /// Move a pending user event to the triggered list and wake the loop.
    /// Unknown ids (never registered, already triggered, already delivered)
    /// report failure instead of panicking.
    pub(crate) fn trigger_user(&self, id: EventId) -> bool {
        let moved = {
            let mut user = self.user.lock();
            match user.pending.remove(&id) {
                Some(waiter) => {
                    user.triggered.push_back((id, waiter));
                    true
                }
                None => false,
            }
        };
        if moved {
            self.wake();
        }
        moved
    }

    /// Remove a user-slot sibling that lost its bound race, wherever it
    /// currently sits.
    pub(crate) fn take_user(&self, id: EventId) -> Option<Waiter> {
        let mut user = self.user.lock();
        if let Some(waiter) = user.pending.remove(&id) {
            return Some(waiter);
        }
        let pos = user.triggered.iter().position(|(tid, _)| *tid == id)?;
        user.triggered.remove(pos).map(|(_, waiter)| waiter)
    }

    pub(crate) fn pop_triggered_user(&self) -> Option<(EventId, Waiter)> {
        self.user.lock().triggered.pop_front()
    }

    pub(crate) fn has_triggered_user(&self) -> bool {
        !self.user.lock().triggered.is_empty()
    }

    pub(crate) fn insert_bound(&self, pair: BoundPair) {
        let mut bound = self.bound.lock();
        bound.by_bound.insert(pair.bound_id, pair.sibling);
        bound.by_sibling.insert(pair.sibling, pair);
    }

    /// External cancellation: fire the trigger side of a pair by its bound
    /// id. The sibling is popped and resumed (interrupted) by the owner
    /// thread's next `wait`.
    pub(crate) fn trigger_bound(&self, bound_id: EventId) -> bool {
        let fired = {
            let mut bound = self.bound.lock();
            match bound.by_bound.remove(&bound_id) {
                Some(sibling) => match bound.by_sibling.remove(&sibling) {
                    Some(pair) => {
                        bound.triggered.push_back(pair);
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };
        if fired {
            self.wake();
        }
        fired
    }

    /// Internal cancellation path for the timer-trigger side: called when a
    /// `TimerKind::Cancel` entry comes due on the owner thread.
    pub(crate) fn claim_pair(&self, bound_id: EventId, sibling: EventId) -> Option<BoundPair> {
        let mut bound = self.bound.lock();
        bound.by_bound.remove(&bound_id)?;
        bound.by_sibling.remove(&sibling)
    }

    pub(crate) fn pop_triggered_bound(&self) -> Option<BoundPair> {
        self.bound.lock().triggered.pop_front()
    }

    pub(crate) fn has_triggered_bound(&self) -> bool {
        !self.bound.lock().triggered.is_empty()
    }

    /// A naturally delivered event cancels its pending pair, if any.
    /// Returns the pair so the reactor can invalidate a timer trigger side.
    pub(crate) fn reconcile_natural(&self, id: EventId) -> Option<BoundPair> {
        let mut bound = self.bound.lock();
        let pair = bound.by_sibling.remove(&id)?;
        bound.by_bound.remove(&pair.bound_id);
        Some(pair)
    }

    pub(crate) fn is_empty(&self) -> bool {
        let user = self.user.lock();
        if !user.pending.is_empty() || !user.triggered.is_empty() {
            return false;
        }
        drop(user);
        let bound = self.bound.lock();
        bound.by_sibling.is_empty() && bound.triggered.is_empty()
    }
}

/// Cloneable foreign-thread handle over a loop's cross-thread tables.
///
/// This is the only way code off the owning thread may touch a reactor:
/// triggering a user event, firing the external side of a bound pair, or
/// just unparking the loop.
#[derive(Debug, Clone)]
pub struct Notifier {
    shared: Arc<Shared>,
}

impl Notifier {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Mark a registered user event ready and wake its loop. Returns false
    /// for ids the reactor does not know.
    pub fn trigger(&self, id: EventId) -> bool {
        self.shared.trigger_user(id)
    }

    /// Fire the trigger side of a bound pair, cancelling and resuming its
    /// sibling with the interrupted flag. Returns false if the pair already
    /// resolved.
    pub fn trigger_bound(&self, bound_id: EventId) -> bool {
        self.shared.trigger_bound(bound_id)
    }

    /// Unpark the owning loop without delivering anything.
    pub fn wake(&self) {
        self.shared.wake();
    }
}
