use crate::runtime::dispatcher::{Dispatcher, Inbox, LoopId, Seed};
use crate::runtime::scheduler::{Handle, Scheduler};
use anyhow::{Context as _, Result};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

const DEFAULT_MAX_EVENTS_PER_WAIT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    /// One loop on the caller's thread.
    Local,
    /// A root (producer) loop on the caller's thread plus parked consumer
    /// loops, one per worker thread, reachable through the dispatcher.
    Pool,
}

#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) max_events_per_wait: usize,
    pub(crate) worker_threads: usize,
}

/// Builds a [`Runtime`].
///
/// ```no_run
/// let runtime = remolino::runtime::Builder::new_pool()
///     .worker_threads(2)
///     .try_build()
///     .unwrap();
/// runtime.block_on(async {
///     // ...
/// });
/// ```
#[derive(Debug, Clone)]
pub struct Builder {
    flavor: Flavor,
    worker_threads: Option<usize>,
    max_events_per_wait: usize,
}

impl Builder {
    pub fn new_local() -> Self {
        Self {
            flavor: Flavor::Local,
            worker_threads: None,
            max_events_per_wait: DEFAULT_MAX_EVENTS_PER_WAIT,
        }
    }

    pub fn new_pool() -> Self {
        Self {
            flavor: Flavor::Pool,
            ..Self::new_local()
        }
    }

    /// Number of consumer loops for the pool flavor. Defaults to the number
    /// of cpus.
    pub fn worker_threads(mut self, count: usize) -> Self {
        assert!(count > 0, "worker_threads may not be 0");
        self.worker_threads = Some(count);
        self
    }

    /// Upper bound on events one reactor wait may deliver.
    pub fn max_events_per_wait(mut self, capacity: usize) -> Self {
        assert!(capacity > 0, "max_events_per_wait may not be 0");
        self.max_events_per_wait = capacity;
        self
    }

    pub fn try_build(self) -> Result<Runtime> {
        let cfg = RuntimeConfig {
            max_events_per_wait: self.max_events_per_wait,
            worker_threads: self.worker_threads.unwrap_or_else(|| {
                thread::available_parallelism().map(usize::from).unwrap_or(1)
            }),
        };

        let dispatcher = Dispatcher::new();
        let root = Scheduler::new(&cfg, Arc::clone(&dispatcher))
            .context("failed to create the root event loop")?
            .into_handle();
        dispatcher.register_producer(root.loop_id(), Arc::clone(root.worker.inbox()));

        let mut workers = Vec::new();
        if self.flavor == Flavor::Pool {
            for index in 0..cfg.worker_threads {
                workers.push(spawn_worker(index, &cfg, &dispatcher)?);
            }
        }

        Ok(Runtime {
            handle: root,
            dispatcher,
            workers,
        })
    }
}

#[derive(Debug)]
struct WorkerHandle {
    loop_id: LoopId,
    inbox: Arc<Inbox>,
    thread: Option<thread::JoinHandle<Result<()>>>,
}

fn spawn_worker(
    index: usize,
    cfg: &RuntimeConfig,
    dispatcher: &Arc<Dispatcher>,
) -> Result<WorkerHandle> {
    let cfg = cfg.clone();
    let dispatcher = Arc::clone(dispatcher);
    let (ready_tx, ready_rx) = mpsc::channel();

    let thread = thread::Builder::new()
        .name(format!("remolino-worker-{index}"))
        .spawn(move || -> Result<()> {
            // The scheduler must be built on the thread that will drive it;
            // its interior is pinned to this thread from here on.
            let handle = match Scheduler::new(&cfg, Arc::clone(&dispatcher)) {
                Ok(scheduler) => scheduler.into_handle(),
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return Ok(());
                }
            };
            let loop_id = handle.loop_id();
            dispatcher.register_consumer(loop_id, Arc::clone(handle.worker.inbox()));
            if ready_tx
                .send(Ok((loop_id, Arc::clone(handle.worker.inbox()))))
                .is_err()
            {
                dispatcher.deregister_consumer(loop_id);
                return Ok(());
            }

            let result = handle.worker.run_parked(&handle);
            dispatcher.deregister_consumer(loop_id);
            result
        })
        .context("failed to spawn worker thread")?;

    let (loop_id, inbox) = ready_rx
        .recv()
        .context("worker thread died before reporting ready")?
        .context("worker event loop creation failed")?;

    Ok(WorkerHandle {
        loop_id,
        inbox,
        thread: Some(thread),
    })
}

/// A set of event loops: the root loop driven by [`Runtime::block_on`] on
/// the building thread, plus (for the pool flavor) parked consumer loops
/// that receive work through [`Handle::dispatch`] / [`Handle::dispatch_to`].
#[derive(Debug)]
pub struct Runtime {
    handle: Handle,
    dispatcher: Arc<Dispatcher>,
    workers: Vec<WorkerHandle>,
}

impl Runtime {
    /// Run a future to completion on the root loop, driving every task
    /// spawned onto it until the loop is idle.
    ///
    /// Must be called on the thread that built the runtime.
    #[track_caller]
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Loop ids of the consumer workers, in spawn order. Targets for
    /// [`Handle::dispatch_to`].
    pub fn worker_ids(&self) -> Vec<LoopId> {
        self.workers.iter().map(|worker| worker.loop_id).collect()
    }

    /// Round-robin a seed from the root loop. See [`Handle::dispatch`].
    pub fn dispatch(&self, seed: Seed) -> Result<LoopId, Seed> {
        self.handle.dispatch(seed)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.dispatcher.deregister_producer(self.handle.loop_id());
        for worker in &self.workers {
            worker.inbox.request_shutdown();
        }
        for worker in &mut self.workers {
            let Some(thread) = worker.thread.take() else {
                continue;
            };
            match thread.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(loop_id = %worker.loop_id, error = %e, "worker loop failed")
                }
                Err(_) => tracing::error!(loop_id = %worker.loop_id, "worker thread panicked"),
            }
        }
        // Anything still owned by the root loop is cancelled, not leaked.
        for task in self.handle.tasks.drain_all() {
            task.shutdown();
        }
        self.handle.released.borrow_mut().clear();
    }
}
