//! Hand-off of host commands to worker pools.
//!
//! A command entry point runs on the host's event loop with the host lock
//! held and must return quickly. [`handle_command`] copies the argument
//! vector, suspends the client, and queues a [`BlockedCommand`] on a pool;
//! the worker runs the handler and resumes the client when it is done.

use super::pool::{PoolId, PoolRegistry};
use crate::host::{BlockedClient, Host, ThreadSafeContext};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchOptions {
    /// Run the handler without acquiring the host lock around it. Handlers
    /// that manage the lock themselves (e.g. through a
    /// [`SearchContext`](crate::concurrent::context::SearchContext)) must
    /// set this; the host lock is not reentrant.
    pub no_host_lock: bool,
}

/// One dispatched command, owned by the worker thread that runs it: the
/// thread-safe host context, the copied argument vector, and the token of
/// the suspended client.
pub struct BlockedCommand {
    host: Arc<dyn Host>,
    ctx: Option<ThreadSafeContext>,
    client: Option<BlockedClient>,
    args: Vec<String>,
    options: DispatchOptions,
}

impl BlockedCommand {
    /// The command arguments. These are the dispatcher's own copies; the
    /// caller's originals may be long gone.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The thread-safe context for replying to the client.
    ///
    /// # Panics
    ///
    /// Panics if the handler already moved the context out with
    /// [`BlockedCommand::take_context`].
    pub fn context(&self) -> &ThreadSafeContext {
        self.ctx
            .as_ref()
            .expect("context was taken by the handler")
    }

    /// Move the context out of the record, transferring its release to a
    /// downstream owner (e.g. a streaming reply). The worker then skips
    /// releasing it after the handler returns.
    pub fn take_context(&mut self) -> ThreadSafeContext {
        self.ctx
            .take()
            .expect("context was already taken")
    }

    fn run<H>(mut self, handler: H)
    where
        H: FnOnce(&mut BlockedCommand),
    {
        if !self.options.no_host_lock {
            self.host.lock();
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| handler(&mut self)));
        if !self.options.no_host_lock {
            self.host.unlock();
        }

        // The context is released here unless the handler took it.
        drop(self.ctx.take());

        // The client is resumed no matter how the handler fared.
        if let Some(client) = self.client.take() {
            self.host.unblock_client(client);
        }

        if let Err(panic_info) = outcome {
            let msg = if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else if let Some(s) = panic_info.downcast_ref::<&str>() {
                (*s).to_string()
            } else {
                "unknown panic".to_string()
            };
            tracing::error!("PANIC in command handler: {}", msg);
        }
    }
}

/// Queue a host command for asynchronous completion on the pool `pool`.
///
/// Copies every argument, suspends the current client, and returns
/// immediately; the caller is free to drop `args` on return. On the worker
/// the handler runs under the host lock (unless
/// [`DispatchOptions::no_host_lock`]), the context is released unless the
/// handler took it, and the client is unblocked unconditionally.
pub fn handle_command<H>(
    pools: &PoolRegistry,
    pool: PoolId,
    options: DispatchOptions,
    host: &Arc<dyn Host>,
    args: &[String],
    handler: H,
) where
    H: FnOnce(&mut BlockedCommand) + Send + 'static,
{
    let args = args.to_vec();
    let client = host.block_client();
    let ctx = ThreadSafeContext::new(Arc::clone(host), client.id());
    let cmd = BlockedCommand {
        host: Arc::clone(host),
        ctx: Some(ctx),
        client: Some(client),
        args,
        options,
    };
    pools.submit(pool, move || cmd.run(handler));
}
