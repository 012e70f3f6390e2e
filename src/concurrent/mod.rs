//! Background execution of host commands: worker pools, the
//! blocked-command dispatcher, and the lock-yielding [`SearchContext`].

pub mod context;
pub mod dispatch;
pub mod pool;

pub use context::{KeyToken, SearchContext, YIELD_BUDGET};
pub use dispatch::{handle_command, BlockedCommand, DispatchOptions};
pub use pool::{PoolId, PoolRegistry, ThreadPool};
