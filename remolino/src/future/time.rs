use crate::event::{EventFlags, FlagCell, Waiter};
use crate::runtime::Handle;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Suspend the calling task for at least `duration`.
///
/// A bare timer cannot be cancelled once registered: dropping the `Sleep`
/// early leaves the heap entry to fire and be discarded.
pub fn sleep(handle: &Handle, duration: Duration) -> Sleep {
    Sleep {
        handle: handle.clone(),
        deadline: Instant::now() + duration,
        state: State::Init,
    }
}

/// Let every other runnable task and pending readiness event get a turn: a
/// zero-duration timer, due on the loop's next wait pass.
pub fn yield_now(handle: &Handle) -> Sleep {
    sleep(handle, Duration::ZERO)
}

pub struct Sleep {
    handle: Handle,
    deadline: Instant,
    state: State,
}

enum State {
    Init,
    Registered(Arc<FlagCell>),
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.state {
            State::Init => {
                let flags = FlagCell::new();
                let waiter = Waiter::new(cx.waker().clone(), Arc::clone(&flags));
                let deadline = this.deadline;
                this.handle
                    .with_reactor(|reactor| reactor.register_timer(deadline, waiter));
                this.state = State::Registered(flags);
                Poll::Pending
            }
            State::Registered(flags) => {
                if flags.get().contains(EventFlags::READY) {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as remolino;
    use crate::runtime::Builder;
    use anyhow::Result;
    use rstest::rstest;
    use std::cell::Cell;
    use std::rc::Rc;

    #[rstest]
    #[case::one_ms(Duration::from_millis(1))]
    #[case::five_ms(Duration::from_millis(5))]
    #[case::twenty_ms(Duration::from_millis(20))]
    fn test_sleep_lasts_at_least_the_duration(#[case] duration: Duration) -> Result<()> {
        let runtime = Builder::new_local().try_build()?;
        let handle = runtime.handle().clone();
        runtime.block_on(async move {
            let start = Instant::now();
            sleep(&handle, duration).await;
            let elapsed = start.elapsed();

            // Scheduler latency can stretch a sleep but must never shrink it.
            assert!(
                elapsed >= duration,
                "sleep was shorter than requested: {elapsed:?} < {duration:?}"
            );
        });
        Ok(())
    }

    #[remolino::test]
    async fn test_sleeps_resume_in_deadline_order() {
        // The test macro binds the root loop as `handle`.
        let late = handle.spawn({
            let h = handle.clone();
            async move {
                sleep(&h, Duration::from_millis(20)).await;
                Instant::now()
            }
        });
        let early = handle.spawn({
            let h = handle.clone();
            async move {
                sleep(&h, Duration::from_millis(5)).await;
                Instant::now()
            }
        });

        let late = late.await.expect("join");
        let early = early.await.expect("join");
        assert!(early <= late, "5ms sleep must finish before 20ms sleep");
    }

    #[remolino::test]
    async fn test_yield_now_lets_peers_run() {
        let ran = Rc::new(Cell::new(false));
        let witness = {
            // The loop is single threaded; the Rc never leaves it.
            let ran = SendCell(Rc::clone(&ran));
            handle.spawn(async move {
                let ran = ran;
                ran.0.set(true);
            })
        };

        yield_now(&handle).await;
        assert!(ran.get(), "the peer task must run during a yield");
        witness.await.expect("join");
    }

    struct SendCell(Rc<Cell<bool>>);
    // Safety: the local flavor runs every task on the test thread.
    unsafe impl Send for SendCell {}
}
