//! Fixed-size worker pools and the process-wide pool registry.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Identifier of one pool inside a [`PoolRegistry`]. Identifiers are
/// assigned in creation order and stay valid for the life of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(pub(crate) usize);

/// A pool of worker threads draining one shared FIFO queue.
///
/// Submission never blocks; the queue is unbounded. Work items start in
/// submission order. A panicking item is caught and logged so the worker
/// thread survives it.
pub struct ThreadPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(threads: usize) -> Self {
        assert!(threads > 0, "a pool needs at least one thread");
        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..threads)
            .map(|i| {
                let receiver = Arc::clone(&receiver);
                std::thread::Builder::new()
                    .name(format!("griddle-worker-{i}"))
                    .spawn(move || worker_loop(&receiver))
                    .expect("failed to spawn pool worker")
            })
            .collect();
        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// Queue a work item. Returns immediately.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        self.sender
            .as_ref()
            .expect("pool is shut down")
            .send(Box::new(job))
            .expect("pool workers exited");
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = {
            let receiver = receiver.lock().unwrap();
            receiver.recv()
        };
        let Ok(job) = job else {
            // Channel closed: the pool is tearing down.
            break;
        };
        if let Err(panic_info) = catch_unwind(AssertUnwindSafe(job)) {
            let msg = if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else if let Some(s) = panic_info.downcast_ref::<&str>() {
                (*s).to_string()
            } else {
                "unknown panic in work item".to_string()
            };
            tracing::error!("PANIC in pool work item: {}", msg);
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Append-only collection of named-by-id worker pools.
pub struct PoolRegistry {
    pools: RwLock<Vec<Arc<ThreadPool>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(Vec::new()),
        }
    }

    /// Create a pool of `threads` workers and return its identifier.
    pub fn create_pool(&self, threads: usize) -> PoolId {
        let mut pools = self.pools.write().unwrap();
        let id = PoolId(pools.len());
        pools.push(Arc::new(ThreadPool::new(threads)));
        tracing::info!("Created worker pool {} with {} threads", id.0, threads);
        id
    }

    /// Queue a work item on the pool identified by `pool`.
    ///
    /// # Panics
    ///
    /// Panics when `pool` was not returned by this registry; passing a
    /// foreign or stale identifier is a programming error.
    pub fn submit(&self, pool: PoolId, job: impl FnOnce() + Send + 'static) {
        let target = {
            let pools = self.pools.read().unwrap();
            Arc::clone(
                pools
                    .get(pool.0)
                    .unwrap_or_else(|| panic!("unknown pool id {}", pool.0)),
            )
        };
        target.submit(job);
    }

    pub fn pool_count(&self) -> usize {
        self.pools.read().unwrap().len()
    }

    pub fn thread_count(&self, pool: PoolId) -> usize {
        self.pools.read().unwrap()[pool.0].thread_count()
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
