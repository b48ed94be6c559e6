use crate::event::{BoundSlot, EventFlags, EventId, FlagCell, Waiter};
use crate::reactor::{BoundTrigger, Notifier};
use crate::runtime::Handle;
use parking_lot::Mutex;
use pin_project::pin_project;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

/// A one-shot, cross-thread signal: the [`Signal`] future suspends its task
/// as a user event on the loop's reactor, and any thread holding the
/// [`SignalHandle`] releases it.
///
/// Triggering before the future was first polled completes it immediately;
/// triggering twice (or after delivery) reports `false`.
pub fn signal(handle: &Handle) -> (Signal, SignalHandle) {
    let inner = Arc::new(Inner {
        slot: Mutex::new(Slot::Unregistered),
    });
    (
        Signal {
            handle: handle.clone(),
            inner: Arc::clone(&inner),
            deadline: None,
            state: State::Init,
        },
        SignalHandle {
            inner,
            notifier: handle.notifier(),
        },
    )
}

/// The signal fired by its deadline instead of its trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline elapsed before the signal fired")]
pub struct Elapsed;

#[derive(Debug)]
struct Inner {
    slot: Mutex<Slot>,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Unregistered,
    /// Triggered before the waiting side first polled.
    PreTriggered,
    Registered(EventId),
}

#[derive(Debug, Clone)]
pub struct SignalHandle {
    inner: Arc<Inner>,
    notifier: Notifier,
}

impl SignalHandle {
    /// Release the waiting task. Safe from any thread. Returns false when
    /// there is nothing left to release.
    pub fn trigger(&self) -> bool {
        let mut slot = self.inner.slot.lock();
        match *slot {
            Slot::Unregistered => {
                *slot = Slot::PreTriggered;
                true
            }
            Slot::PreTriggered => false,
            Slot::Registered(id) => {
                drop(slot);
                self.notifier.trigger(id)
            }
        }
    }
}

pub struct Signal {
    handle: Handle,
    inner: Arc<Inner>,
    deadline: Option<Instant>,
    state: State,
}

enum State {
    Init,
    Registered(Arc<FlagCell>),
    Done,
}

impl Signal {
    /// Race the signal against a deadline; losing yields [`Elapsed`].
    pub fn deadline(mut self, at: Instant) -> SignalWithDeadline {
        self.deadline = Some(at);
        SignalWithDeadline { signal: self }
    }

    /// Register (on first poll) and report the outcome flags once ready.
    fn poll_flags(&mut self, cx: &mut Context<'_>) -> Poll<EventFlags> {
        match &self.state {
            State::Init => {
                let mut slot = self.inner.slot.lock();
                if matches!(*slot, Slot::PreTriggered) {
                    self.state = State::Done;
                    return Poll::Ready(EventFlags::READY);
                }
                let flags = FlagCell::new();
                let waiter = Waiter::new(cx.waker().clone(), Arc::clone(&flags));
                let deadline = self.deadline;
                let id = self.handle.with_reactor(|reactor| {
                    let id = reactor.register_user(waiter);
                    if let Some(at) = deadline {
                        reactor.register_bound(id, BoundSlot::User, BoundTrigger::Deadline(at));
                    }
                    id
                });
                *slot = Slot::Registered(id);
                self.state = State::Registered(flags);
                Poll::Pending
            }
            State::Registered(flags) => {
                let got = flags.get();
                if got.contains(EventFlags::READY) {
                    self.state = State::Done;
                    Poll::Ready(got)
                } else {
                    Poll::Pending
                }
            }
            State::Done => panic!("Signal polled after completion"),
        }
    }
}

impl Future for Signal {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().poll_flags(cx).map(|_| ())
    }
}

#[pin_project]
pub struct SignalWithDeadline {
    #[pin]
    signal: Signal,
}

impl Future for SignalWithDeadline {
    type Output = Result<(), Elapsed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.signal.get_mut().poll_flags(cx).map(|flags| {
            if flags.contains(EventFlags::INTERRUPTED) {
                Err(Elapsed)
            } else {
                Ok(())
            }
        })
    }
}
