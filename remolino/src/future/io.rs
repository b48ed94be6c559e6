use crate::event::{BoundSlot, Direction, EventFlags, FlagCell, Waiter};
use crate::reactor::BoundTrigger;
use crate::runtime::Handle;
use std::io;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

/// The suspension primitive socket collaborators build on: an attempt
/// closure over a non-blocking descriptor, suspended on readiness whenever
/// the attempt would block.
///
/// First-poll behavior follows the direction: a read registers straight
/// away, while write/accept/connect probe the attempt first and only
/// suspend on `WouldBlock` (`EINPROGRESS` for connect). After a resumption
/// the attempt runs again; a closed-out waiter resumes with
/// `ErrorKind::NotConnected` and a lost deadline race with
/// `ErrorKind::TimedOut`.
///
/// The reactor is agnostic to what the descriptor represents; the one
/// contract is that the owner calls [`Handle::remove_all_io`] before the
/// descriptor number is reused.
pub struct IoAwaiter<T, F: FnMut() -> io::Result<T>> {
    handle: Handle,
    fd: RawFd,
    direction: Direction,
    attempt: F,
    deadline: Option<Instant>,
    state: State,
}

enum State {
    Init,
    Registered(Arc<FlagCell>),
    Done,
}

impl<T, F: FnMut() -> io::Result<T>> IoAwaiter<T, F> {
    pub fn new(handle: &Handle, fd: RawFd, direction: Direction, attempt: F) -> Self {
        Self {
            handle: handle.clone(),
            fd,
            direction,
            attempt,
            deadline: None,
            state: State::Init,
        }
    }

    /// Race the wait against a deadline. Whichever side fires first cancels
    /// the other; losing to the deadline surfaces as `ErrorKind::TimedOut`.
    pub fn deadline(mut self, at: Instant) -> Self {
        self.deadline = Some(at);
        self
    }
}

fn would_block(error: &io::Error, direction: Direction) -> bool {
    error.kind() == io::ErrorKind::WouldBlock
        || (direction == Direction::Connect && error.raw_os_error() == Some(libc::EINPROGRESS))
}

impl<T, F> Future for IoAwaiter<T, F>
where
    F: FnMut() -> io::Result<T> + Unpin,
{
    type Output = io::Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match &this.state {
                State::Init => {
                    if this.direction != Direction::Read {
                        match (this.attempt)() {
                            Ok(value) => {
                                this.state = State::Done;
                                return Poll::Ready(Ok(value));
                            }
                            Err(e) if would_block(&e, this.direction) => {}
                            Err(e) => {
                                this.state = State::Done;
                                return Poll::Ready(Err(e));
                            }
                        }
                    }
                    let flags = FlagCell::new();
                    let waiter = Waiter::new(cx.waker().clone(), Arc::clone(&flags));
                    let (fd, direction, deadline) = (this.fd, this.direction, this.deadline);
                    this.handle.with_reactor(|reactor| {
                        let id = reactor.register_io(fd, direction, waiter);
                        if let Some(at) = deadline {
                            reactor.register_bound(
                                id,
                                BoundSlot::Io { fd, direction },
                                BoundTrigger::Deadline(at),
                            );
                        }
                    });
                    this.state = State::Registered(flags);
                    return Poll::Pending;
                }
                State::Registered(flags) => {
                    let got = flags.get();
                    if !got.contains(EventFlags::READY) {
                        return Poll::Pending;
                    }
                    if got.contains(EventFlags::INTERRUPTED) {
                        this.state = State::Done;
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "deadline elapsed before readiness",
                        )));
                    }
                    if got.contains(EventFlags::CLOSED) {
                        this.state = State::Done;
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::NotConnected,
                            "descriptor closed while waiting for readiness",
                        )));
                    }
                    return match (this.attempt)() {
                        Ok(value) => {
                            this.state = State::Done;
                            Poll::Ready(Ok(value))
                        }
                        Err(e) if would_block(&e, this.direction) => {
                            // Readiness raced away under level triggering;
                            // go around and register again.
                            this.state = State::Init;
                            continue;
                        }
                        Err(e) => {
                            this.state = State::Done;
                            Poll::Ready(Err(e))
                        }
                    };
                }
                State::Done => panic!("IoAwaiter polled after completion"),
            }
        }
    }
}
