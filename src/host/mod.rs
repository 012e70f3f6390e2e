//! Abstract surface of the embedding host server.
//!
//! The host is a single-threaded database server that owns every data
//! structure the extension touches. Access is serialized by one
//! process-wide lock; clients whose commands run in the background are
//! suspended with [`Host::block_client`] and resumed once a worker has
//! produced their reply. Everything the core needs from the host is
//! captured by the [`Host`] trait so the core can be embedded, or run in
//! tests against the in-process [`sim::SimHost`].

pub mod sim;

use std::sync::Arc;

/// Identifies one connected client for reply routing.
pub type ClientId = u64;

/// How a key is opened, mirroring the host's access-mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// An open host key. Handles are opaque and only valid while the host lock
/// is held; clones alias the same underlying key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHandle {
    id: u64,
}

impl KeyHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self { id }
    }

    /// Host-assigned identity of this handle. Fresh on every open.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Token for a client whose reply has been deferred. Obtained from
/// [`Host::block_client`] and consumed by [`Host::unblock_client`];
/// deliberately not clonable so each suspension is resumed exactly once.
#[derive(Debug)]
pub struct BlockedClient {
    pub(crate) id: ClientId,
}

impl BlockedClient {
    /// The suspended client's identity.
    pub fn id(&self) -> ClientId {
        self.id
    }
}

/// A reply written back to a (possibly blocked) client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
}

/// The host operations the core consumes.
///
/// `lock`/`unlock` are the host's global lock. The lock is not reentrant:
/// locking twice from one thread is a programmer error, and implementations
/// are encouraged to panic on it rather than deadlock silently.
pub trait Host: Send + Sync + 'static {
    /// Acquire the host lock, blocking until it is free.
    fn lock(&self);

    /// Release the host lock. Must be called by the holding thread.
    fn unlock(&self);

    /// Suspend the current client; its reply is deferred until
    /// [`Host::unblock_client`].
    fn block_client(&self) -> BlockedClient;

    /// Resume a suspended client.
    fn unblock_client(&self, client: BlockedClient);

    /// Write a reply for the given client.
    fn reply(&self, client: ClientId, reply: Reply);

    /// Open a key by name. Returns `None` when the key does not exist and
    /// the mode is [`OpenMode::Read`]; [`OpenMode::Write`] creates missing
    /// keys. Must be called with the host lock held.
    fn open_key(&self, name: &str, mode: OpenMode) -> Option<KeyHandle>;

    /// Close a previously opened key. Must be called with the host lock
    /// held.
    fn close_key(&self, key: KeyHandle);
}

/// A host context usable from a worker thread, bound to one blocked client.
///
/// Replies route to that client. Dropping the context releases it; a
/// handler that hands the reply off to a downstream owner moves the whole
/// context out instead (see
/// [`BlockedCommand::take_context`](crate::concurrent::dispatch::BlockedCommand::take_context)).
pub struct ThreadSafeContext {
    host: Arc<dyn Host>,
    client: ClientId,
}

impl ThreadSafeContext {
    pub(crate) fn new(host: Arc<dyn Host>, client: ClientId) -> Self {
        Self { host, client }
    }

    /// The host this context talks to.
    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    /// The client this context replies to.
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Write a reply to the bound client.
    pub fn reply(&self, reply: Reply) {
        self.host.reply(self.client, reply);
    }
}
