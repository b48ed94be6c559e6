use crate::reactor::Shared;
use crate::runtime::Handle;
use crate::task::Task;
use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Identifier of one event loop, unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopId(u64);

impl LoopId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A dispatched unit of work. It runs on the target loop's thread with that
/// loop's handle and typically spawns there; building the future against
/// the receiving handle is what keeps its awaiters registered with the
/// right reactor.
pub type Seed = Box<dyn FnOnce(&Handle) + Send + 'static>;

/// A loop's thread-safe mailbox: dispatched seeds, tasks woken from foreign
/// threads, and the shutdown request. Delivery wakes the loop's reactor so
/// a parked `wait` returns promptly.
pub(crate) struct Inbox {
    seeds: SegQueue<Seed>,
    tasks: SegQueue<Task>,
    shutdown: AtomicBool,
    shared: Arc<Shared>,
}

impl Inbox {
    pub(crate) fn new(shared: Arc<Shared>) -> Arc<Self> {
        Arc::new(Self {
            seeds: SegQueue::new(),
            tasks: SegQueue::new(),
            shutdown: AtomicBool::new(false),
            shared,
        })
    }

    pub(crate) fn push_seed(&self, seed: Seed) {
        self.seeds.push(seed);
        self.shared.wake();
    }

    pub(crate) fn push_task(&self, task: Task) {
        self.tasks.push(task);
        self.shared.wake();
    }

    pub(crate) fn pop_seed(&self) -> Option<Seed> {
        self.seeds.pop()
    }

    pub(crate) fn pop_task(&self) -> Option<Task> {
        self.tasks.pop()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.seeds.is_empty() && self.tasks.is_empty()
    }

    pub(crate) fn wake(&self) {
        self.shared.wake();
    }

    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.shared.wake();
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Inbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbox")
            .field("seeds", &self.seeds.len())
            .field("tasks", &self.tasks.len())
            .field("shutdown", &self.shutdown_requested())
            .finish()
    }
}

/// Cross-loop router. Consumer loops opt in as round-robin targets;
/// producers register only so addressed delivery can reach them.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    /// Round-robin order. Only consumers.
    consumers: Mutex<Vec<(LoopId, Arc<Inbox>)>>,
    /// Every registered loop, for addressed delivery.
    registered: DashMap<LoopId, Arc<Inbox>>,
    rr: AtomicUsize,
}

impl Dispatcher {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            consumers: Mutex::new(Vec::new()),
            registered: DashMap::new(),
            rr: AtomicUsize::new(0),
        })
    }

    pub(crate) fn register_consumer(&self, id: LoopId, inbox: Arc<Inbox>) {
        self.registered.insert(id, inbox.clone());
        self.consumers.lock().push((id, inbox));
    }

    pub(crate) fn deregister_consumer(&self, id: LoopId) {
        self.consumers.lock().retain(|(lid, _)| *lid != id);
        self.registered.remove(&id);
    }

    pub(crate) fn register_producer(&self, id: LoopId, inbox: Arc<Inbox>) {
        self.registered.insert(id, inbox);
    }

    pub(crate) fn deregister_producer(&self, id: LoopId) {
        self.registered.remove(&id);
    }

    /// Round-robin delivery, skipping the caller's own loop when a distinct
    /// target exists. Returns the chosen loop, or the seed when no consumer
    /// is registered.
    pub(crate) fn dispatch(&self, caller: LoopId, seed: Seed) -> Result<LoopId, Seed> {
        let consumers = self.consumers.lock();
        if consumers.is_empty() {
            return Err(seed);
        }
        let start = self.rr.fetch_add(1, Ordering::Relaxed) % consumers.len();
        let mut chosen = start;
        for offset in 0..consumers.len() {
            let idx = (start + offset) % consumers.len();
            if consumers[idx].0 != caller {
                chosen = idx;
                break;
            }
        }
        let (id, inbox) = &consumers[chosen];
        tracing::trace!(target_loop = %id, "dispatching seed");
        inbox.push_seed(seed);
        Ok(*id)
    }

    /// Addressed delivery. An unknown loop id hands the seed back to the
    /// caller rather than dropping it.
    pub(crate) fn dispatch_to(&self, target: LoopId, seed: Seed) -> Result<(), Seed> {
        match self.registered.get(&target) {
            Some(inbox) => {
                inbox.push_seed(seed);
                Ok(())
            }
            None => Err(seed),
        }
    }
}
