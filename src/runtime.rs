//! Process-scoped wiring: the pool registry, the two well-known pools, and
//! the indexing queue, owned by one explicitly-passed value.

use crate::concurrent::dispatch::{self, BlockedCommand, DispatchOptions};
use crate::concurrent::pool::{PoolId, PoolRegistry};
use crate::config::RuntimeConfig;
use crate::host::Host;
use crate::indexing::queue::AsyncIndexQueue;
use crate::indexing::Indexer;
use std::sync::Arc;
use std::time::Duration;

/// Everything the extension keeps alive for the life of the process.
///
/// Field order matters: the indexing queue is declared first so its worker
/// joins before the pools tear down.
pub struct Runtime {
    queue: AsyncIndexQueue,
    pools: Arc<PoolRegistry>,
    host: Arc<dyn Host>,
    search_pool: PoolId,
    index_pool: PoolId,
}

impl Runtime {
    /// Bring up the pools and the indexing worker.
    ///
    /// The search pool gets `search_pool_size` threads. The index pool is
    /// sized to the online processor count unless `pool_size_no_auto` is
    /// set, falling back to `index_pool_size` when auto-detection is off or
    /// fails.
    pub fn start(config: &RuntimeConfig, host: Arc<dyn Host>, indexer: Arc<dyn Indexer>) -> Self {
        let pools = Arc::new(PoolRegistry::new());
        let search_pool = pools.create_pool(config.search_pool_size);

        let mut index_threads = 0;
        if !config.pool_size_no_auto {
            index_threads = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(0);
        }
        if index_threads < 1 {
            index_threads = config.index_pool_size;
        }
        let index_pool = pools.create_pool(index_threads);

        let queue = AsyncIndexQueue::start(
            Duration::from_millis(config.index_queue_interval_ms),
            config.index_batch_size,
            Arc::clone(&host),
            indexer,
        );

        Self {
            queue,
            pools,
            host,
            search_pool,
            index_pool,
        }
    }

    pub fn pools(&self) -> &Arc<PoolRegistry> {
        &self.pools
    }

    /// The pool search-type commands are dispatched to.
    pub fn search_pool(&self) -> PoolId {
        self.search_pool
    }

    /// The pool indexing-type commands are dispatched to.
    pub fn index_pool(&self) -> PoolId {
        self.index_pool
    }

    pub fn index_queue(&self) -> &AsyncIndexQueue {
        &self.queue
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    /// Dispatch a host command to `pool` for asynchronous completion. See
    /// [`dispatch::handle_command`].
    pub fn handle_command<H>(
        &self,
        pool: PoolId,
        options: DispatchOptions,
        args: &[String],
        handler: H,
    ) where
        H: FnOnce(&mut BlockedCommand) + Send + 'static,
    {
        dispatch::handle_command(self.pools.as_ref(), pool, options, &self.host, args, handler);
    }
}
