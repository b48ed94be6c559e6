use super::scheduler::Scheduler;
use super::*;
use crate::future::io::IoAwaiter;
use crate::future::signal::{Elapsed, signal};
use crate::future::time;
use crate::task::JoinError;
use crate::utils::scheduler::Call;
use anyhow::Result;
use static_assertions::assert_impl_all;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read as _, Write as _};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

assert_impl_all!(Scheduler: Send, Sync);
assert_impl_all!(Handle: Send, Sync, Clone, Schedule);

#[test]
fn test_spawn_and_join_carries_the_value() -> Result<()> {
    let runtime = Builder::new_local().try_build()?;
    let handle = runtime.handle().clone();
    let value = runtime.block_on(async move {
        let task = handle.spawn(async { 2 + 2 });
        task.await.expect("join")
    });
    assert_eq!(value, 4);
    Ok(())
}

#[test]
fn test_block_on_runs_detached_tasks_until_idle() -> Result<()> {
    let runtime = Builder::new_local().try_build()?;
    let handle = runtime.handle().clone();
    let finished = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&finished);
    runtime.block_on(async move {
        let h = handle.clone();
        // Dropping the JoinHandle detaches; the loop still drives the task
        // to completion before block_on returns.
        drop(handle.spawn(async move {
            time::sleep(&h, Duration::from_millis(10)).await;
            flag.store(true, Ordering::Release);
        }));
    });

    assert!(finished.load(Ordering::Acquire));
    Ok(())
}

#[test]
fn test_panic_propagates_to_the_awaiting_task_only() -> Result<()> {
    let runtime = Builder::new_local().try_build()?;
    let handle = runtime.handle().clone();

    let root = runtime.handle().clone();
    runtime.block_on(async move {
        let failing = handle.spawn(async { panic!("boom") });
        let awaiter = handle.spawn(async move { failing.await });
        let unrelated = handle.spawn(async { 7 });

        let error = awaiter
            .await
            .expect("the awaiting task itself must not fail")
            .expect_err("the awaited failure must propagate");
        assert!(error.is_panic());
        let payload = error.into_panic();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));

        assert_eq!(unrelated.await.expect("join"), 7);
    });

    // The failure was consumed by the awaiter; the sink stays silent.
    assert_eq!(root.unhandled_failures(), 0);
    Ok(())
}

#[test]
fn test_detached_failure_reaches_the_sink_exactly_once() -> Result<()> {
    let runtime = Builder::new_local().try_build()?;
    let handle = runtime.handle().clone();
    let root = runtime.handle().clone();

    runtime.block_on(async move {
        drop(handle.spawn(async { panic!("nobody is listening") }));
        time::yield_now(&handle).await;
    });

    assert_eq!(root.unhandled_failures(), 1);
    assert_eq!(
        root.tracker
            .count(|call| matches!(call, Call::UnhandledFailure { .. })),
        1
    );
    Ok(())
}

#[test]
fn test_every_finished_task_is_released_once() -> Result<()> {
    let runtime = Builder::new_local().try_build()?;
    let handle = runtime.handle().clone();
    let root = runtime.handle().clone();

    let id = runtime.block_on(async move {
        let task = handle.spawn(async { "done" });
        let id = task.id();
        assert_eq!(task.await.expect("join"), "done");
        id
    });

    assert_eq!(
        root.tracker
            .count(|call| matches!(call, Call::Release { id: released } if *released == id)),
        1
    );
    assert!(root.tasks.is_empty());
    Ok(())
}

#[test]
fn test_round_robin_dispatch_is_fair() -> Result<()> {
    const WORKERS: usize = 3;
    const SEEDS: usize = 30;

    let runtime = Builder::new_pool().worker_threads(WORKERS).try_build()?;
    let (tx, rx) = mpsc::channel();

    let mut chosen: HashMap<LoopId, usize> = HashMap::new();
    for _ in 0..SEEDS {
        let tx = tx.clone();
        let seed: Seed = Box::new(move |worker: &Handle| {
            tx.send(worker.loop_id()).expect("report delivery");
        });
        let target = match runtime.dispatch(seed) {
            Ok(target) => target,
            Err(_) => panic!("consumers are registered"),
        };
        *chosen.entry(target).or_default() += 1;
    }

    // Every seed executes on the loop the dispatcher picked for it.
    let mut executed: HashMap<LoopId, usize> = HashMap::new();
    for _ in 0..SEEDS {
        let id = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("seed executed");
        *executed.entry(id).or_default() += 1;
    }

    assert_eq!(chosen, executed);
    assert_eq!(chosen.len(), WORKERS);
    for count in chosen.values() {
        assert_eq!(*count, SEEDS / WORKERS);
    }
    Ok(())
}

#[test]
fn test_dispatch_to_unknown_loop_returns_the_seed() -> Result<()> {
    let stale = {
        let other = Builder::new_pool().worker_threads(1).try_build()?;
        other.worker_ids()[0]
        // `other` drops here; its worker deregisters.
    };

    let runtime = Builder::new_local().try_build()?;
    let seed: Seed = Box::new(|_worker: &Handle| unreachable!("must not be delivered"));
    assert!(runtime.handle().dispatch_to(stale, seed).is_err());

    // No consumers at all: round-robin hands the seed back too.
    let seed: Seed = Box::new(|_worker: &Handle| unreachable!("must not be delivered"));
    assert!(runtime.handle().dispatch(seed).is_err());
    Ok(())
}

#[test]
fn test_dispatched_seeds_run_in_fifo_order_per_target() -> Result<()> {
    let runtime = Builder::new_pool().worker_threads(1).try_build()?;
    let target = runtime.worker_ids()[0];
    let (tx, rx) = mpsc::channel();

    for index in 0..5usize {
        let tx = tx.clone();
        let seed: Seed = Box::new(move |_worker: &Handle| {
            tx.send(index).expect("report order");
        });
        assert!(runtime.handle().dispatch_to(target, seed).is_ok());
    }

    let order: Vec<usize> = (0..5)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("delivery"))
        .collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
    Ok(())
}

#[test]
fn test_cross_loop_signal_wakes_the_root_future() -> Result<()> {
    let runtime = Builder::new_pool().worker_threads(2).try_build()?;
    let handle = runtime.handle().clone();

    let value = runtime.block_on(async move {
        let (sig, trigger) = signal(&handle);
        let seed: Seed = Box::new(move |worker: &Handle| {
            let w = worker.clone();
            worker.spawn(async move {
                time::sleep(&w, Duration::from_millis(5)).await;
                assert!(trigger.trigger());
            });
        });
        assert!(handle.dispatch(seed).is_ok());
        sig.await;
        42
    });

    assert_eq!(value, 42);
    Ok(())
}

#[test]
fn test_signal_triggered_before_first_poll_completes_immediately() -> Result<()> {
    let runtime = Builder::new_local().try_build()?;
    let handle = runtime.handle().clone();

    runtime.block_on(async move {
        let (sig, trigger) = signal(&handle);
        assert!(trigger.trigger());
        // A second trigger has nothing left to release.
        assert!(!trigger.trigger());
        sig.await;
    });
    Ok(())
}

#[test]
fn test_signal_deadline_elapses_without_a_trigger() -> Result<()> {
    let runtime = Builder::new_local().try_build()?;
    let handle = runtime.handle().clone();

    runtime.block_on(async move {
        let (sig, _trigger) = signal(&handle);
        let result = sig.deadline(Instant::now() + Duration::from_millis(10)).await;
        assert_eq!(result, Err(Elapsed));
    });
    Ok(())
}

#[test]
fn test_signal_beats_its_deadline() -> Result<()> {
    let runtime = Builder::new_local().try_build()?;
    let handle = runtime.handle().clone();

    runtime.block_on(async move {
        let (sig, trigger) = signal(&handle);
        let h = handle.clone();
        drop(handle.spawn(async move {
            time::sleep(&h, Duration::from_millis(5)).await;
            assert!(trigger.trigger());
        }));
        let result = sig.deadline(Instant::now() + Duration::from_millis(500)).await;
        assert_eq!(result, Ok(()));
    });
    Ok(())
}

#[test]
fn test_remove_all_io_resumes_waiters_with_a_closed_error() -> Result<()> {
    let runtime = Builder::new_local().try_build()?;
    let handle = runtime.handle().clone();
    let (rd, _wr) = nix::unistd::pipe()?;
    let fd = rd.as_raw_fd();

    runtime.block_on(async move {
        let h = handle.clone();
        let waiter = handle.spawn(async move {
            let mut file = File::from(rd);
            IoAwaiter::new(&h, fd, crate::Direction::Read, move || {
                let mut buf = [0u8; 1];
                file.read(&mut buf)
            })
            .await
        });

        // One turn so the waiter registers its interest, then tear down.
        time::yield_now(&handle).await;
        assert_eq!(handle.remove_all_io(fd).expect("remove_all_io"), 1);

        let error = waiter
            .await
            .expect("join")
            .expect_err("a torn-down waiter resumes with an error");
        assert_eq!(error.kind(), io::ErrorKind::NotConnected);
    });
    Ok(())
}

#[test]
fn test_io_readiness_beats_a_late_deadline() -> Result<()> {
    let runtime = Builder::new_local().try_build()?;
    let handle = runtime.handle().clone();
    let (rd, wr) = nix::unistd::pipe()?;
    let fd = rd.as_raw_fd();

    let writer = std::thread::spawn(move || {
        let mut wr = File::from(wr);
        std::thread::sleep(Duration::from_millis(10));
        wr.write_all(b"x").expect("write");
    });

    runtime.block_on(async move {
        let mut file = File::from(rd);
        let n = IoAwaiter::new(&handle, fd, crate::Direction::Read, move || {
            let mut buf = [0u8; 8];
            file.read(&mut buf)
        })
        .deadline(Instant::now() + Duration::from_millis(500))
        .await
        .expect("readiness must win");
        assert_eq!(n, 1);
        handle.remove_all_io(fd).expect("teardown");
    });

    writer.join().expect("writer");
    Ok(())
}

#[test]
fn test_deadline_beats_late_io_readiness() -> Result<()> {
    let runtime = Builder::new_local().try_build()?;
    let handle = runtime.handle().clone();
    let (rd, wr) = nix::unistd::pipe()?;
    let fd = rd.as_raw_fd();

    let writer = std::thread::spawn(move || {
        let mut wr = File::from(wr);
        std::thread::sleep(Duration::from_millis(200));
        // The read end may already be torn down by then.
        let _ = wr.write_all(b"x");
    });

    runtime.block_on(async move {
        let mut file = File::from(rd);
        let error = IoAwaiter::new(&handle, fd, crate::Direction::Read, move || {
            let mut buf = [0u8; 8];
            file.read(&mut buf)
        })
        .deadline(Instant::now() + Duration::from_millis(15))
        .await
        .expect_err("the deadline must win");
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);
        handle.remove_all_io(fd).expect("teardown");
    });

    writer.join().expect("writer");
    Ok(())
}

#[test]
fn test_write_awaiter_completes_without_suspending_when_ready() -> Result<()> {
    let runtime = Builder::new_local().try_build()?;
    let handle = runtime.handle().clone();
    let (_rd, wr) = nix::unistd::pipe()?;
    let fd = wr.as_raw_fd();

    runtime.block_on(async move {
        // An empty pipe is writable: the first-poll probe succeeds and the
        // awaiter never touches the reactor.
        let mut file = File::from(wr);
        let n = IoAwaiter::new(&handle, fd, crate::Direction::Write, move || {
            file.write(b"hello")
        })
        .await
        .expect("write");
        assert_eq!(n, 5);
    });
    Ok(())
}
