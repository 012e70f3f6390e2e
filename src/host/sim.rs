//! In-process host emulation.
//!
//! Stands in for the embedding server in tests and embedder test suites: a
//! real blocking global lock with holder tracking, a keyspace that mints a
//! fresh handle id on every open, and bookkeeping for blocked clients and
//! replies. The lock panics on misuse (reentrant lock, unlock from a
//! non-holder) so protocol violations surface as test failures instead of
//! deadlocks.

use super::{BlockedClient, ClientId, Host, KeyHandle, OpenMode, Reply};
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::ThreadId;

/// Ticket-based global lock state. FIFO handoff matters: a task that
/// yields by releasing and immediately re-requesting the lock must lose to
/// a thread that was already waiting, or the yield does nothing.
#[derive(Default)]
struct GilState {
    holder: Option<ThreadId>,
    next_ticket: u64,
    now_serving: u64,
}

pub struct SimHost {
    gil: Mutex<GilState>,
    gil_cond: Condvar,
    keys: DashSet<String>,
    open_handles: DashMap<u64, String>,
    next_handle: AtomicU64,
    next_client: AtomicU64,
    blocked: DashSet<ClientId>,
    replies: DashMap<ClientId, Vec<Reply>>,
    unblocked: AtomicUsize,
}

impl SimHost {
    pub fn new() -> Self {
        Self {
            gil: Mutex::new(GilState::default()),
            gil_cond: Condvar::new(),
            keys: DashSet::new(),
            open_handles: DashMap::new(),
            next_handle: AtomicU64::new(0),
            next_client: AtomicU64::new(0),
            blocked: DashSet::new(),
            replies: DashMap::new(),
            unblocked: AtomicUsize::new(0),
        }
    }

    fn assert_holder(&self, op: &str) {
        let gil = self.gil.lock().unwrap();
        assert_eq!(
            gil.holder,
            Some(std::thread::current().id()),
            "{op} requires the host lock"
        );
    }

    /// Create a key directly, taking the host lock itself. Stands in for
    /// event-loop activity happening while a background task has yielded.
    pub fn insert_key(&self, name: &str) {
        self.lock();
        self.keys.insert(name.to_string());
        self.unlock();
    }

    /// Delete a key directly, taking the host lock itself.
    pub fn delete_key(&self, name: &str) {
        self.lock();
        self.keys.remove(name);
        self.unlock();
    }

    pub fn key_exists(&self, name: &str) -> bool {
        self.keys.contains(name)
    }

    /// Number of handles currently open against the keyspace.
    pub fn open_handle_count(&self) -> usize {
        self.open_handles.len()
    }

    pub fn handle_is_open(&self, id: u64) -> bool {
        self.open_handles.contains_key(&id)
    }

    /// How many blocked clients have been resumed so far.
    pub fn unblocked_clients(&self) -> usize {
        self.unblocked.load(Ordering::SeqCst)
    }

    /// All replies written for the given client, in order.
    pub fn replies_for(&self, client: ClientId) -> Vec<Reply> {
        self.replies
            .get(&client)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    pub fn is_locked(&self) -> bool {
        self.gil.lock().unwrap().holder.is_some()
    }
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for SimHost {
    fn lock(&self) {
        let me = std::thread::current().id();
        let mut gil = self.gil.lock().unwrap();
        assert_ne!(gil.holder, Some(me), "host lock is not reentrant");
        let ticket = gil.next_ticket;
        gil.next_ticket += 1;
        while gil.now_serving != ticket {
            gil = self.gil_cond.wait(gil).unwrap();
        }
        gil.holder = Some(me);
    }

    fn unlock(&self) {
        let me = std::thread::current().id();
        let mut gil = self.gil.lock().unwrap();
        assert_eq!(gil.holder, Some(me), "host lock released by a non-holder");
        gil.holder = None;
        gil.now_serving += 1;
        self.gil_cond.notify_all();
    }

    fn block_client(&self) -> BlockedClient {
        let id = self.next_client.fetch_add(1, Ordering::SeqCst) + 1;
        self.blocked.insert(id);
        BlockedClient { id }
    }

    fn unblock_client(&self, client: BlockedClient) {
        let removed = self.blocked.remove(&client.id);
        assert!(removed.is_some(), "client {} was not blocked", client.id);
        self.unblocked.fetch_add(1, Ordering::SeqCst);
    }

    fn reply(&self, client: ClientId, reply: Reply) {
        self.replies.entry(client).or_default().push(reply);
    }

    fn open_key(&self, name: &str, mode: OpenMode) -> Option<KeyHandle> {
        self.assert_holder("open_key");
        match mode {
            OpenMode::Read => {
                if !self.keys.contains(name) {
                    return None;
                }
            }
            OpenMode::Write => {
                self.keys.insert(name.to_string());
            }
        }
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        self.open_handles.insert(id, name.to_string());
        Some(KeyHandle::new(id))
    }

    fn close_key(&self, key: KeyHandle) {
        self.assert_holder("close_key");
        let removed = self.open_handles.remove(&key.id());
        assert!(
            removed.is_some(),
            "close of unknown or already-closed key handle {}",
            key.id()
        );
    }
}
