//! Cooperative lock yielding for long-running background tasks.
//!
//! A background task holds the host lock while it touches host state, and
//! must periodically let go of it so the event loop can serve other
//! clients. Releasing the lock invalidates every key handle the task has
//! open: the keyspace can change arbitrarily while the lock is down. The
//! [`SearchContext`] tracks those handles, closes them before the lock is
//! released, reopens them by name when it is reacquired, and notifies each
//! holder through its reopen callback so cached iterator state can be
//! refreshed or invalidated.
//!
//! User code never keeps a handle across a yield. It keeps the [`KeyToken`]
//! returned at tracking time and asks the context for the current handle on
//! demand; while the context is unlocked there is no handle to get.

use crate::host::{Host, KeyHandle, OpenMode};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a task may run between yields of the host lock.
pub const YIELD_BUDGET: Duration = Duration::from_millis(100);

/// [`SearchContext::tick`] consults the clock once per this many calls.
const TICK_CHECK_GRANULARITY: u32 = 100;

/// Called after every reopen with the fresh handle, or `None` when the key
/// no longer exists. Any iterator state the holder needs to refresh lives
/// in the closure's captures.
pub type ReopenCallback = Box<dyn FnMut(Option<&KeyHandle>) + Send>;

enum KeyState {
    /// Opened by this context; closed on yield.
    Owned(KeyHandle),
    /// Handed in by another owner; left alone on yield, replaced by an
    /// owned handle on the next reopen.
    Borrowed(KeyHandle),
    /// No current handle (context unlocked, or the key vanished).
    Closed,
}

impl KeyState {
    fn handle(&self) -> Option<&KeyHandle> {
        match self {
            KeyState::Owned(h) | KeyState::Borrowed(h) => Some(h),
            KeyState::Closed => None,
        }
    }
}

struct TrackedKey {
    state: KeyState,
    name: Arc<str>,
    mode: OpenMode,
    on_reopen: ReopenCallback,
}

/// Stable reference to one tracked key within its [`SearchContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyToken(usize);

/// Tracks the host handles of one background task and yields the host lock
/// when the task has outrun its time budget.
///
/// Owned by exactly one worker thread; not shared.
pub struct SearchContext {
    host: Arc<dyn Host>,
    locked: bool,
    keys: Vec<TrackedKey>,
    last_locked: Instant,
    ticker: u32,
}

impl SearchContext {
    /// A new, unlocked context with no tracked keys.
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self {
            host,
            locked: false,
            keys: Vec::new(),
            last_locked: Instant::now(),
            ticker: 0,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn tracked_keys(&self) -> usize {
        self.keys.len()
    }

    /// Register a freshly opened key this context owns. It will be closed
    /// before every yield and reopened by name on every resume, with
    /// `on_reopen` told about the replacement.
    ///
    /// # Panics
    ///
    /// Panics when called while the context does not hold the host lock.
    pub fn track_key(
        &mut self,
        handle: KeyHandle,
        name: impl Into<Arc<str>>,
        mode: OpenMode,
        on_reopen: impl FnMut(Option<&KeyHandle>) + Send + 'static,
    ) -> KeyToken {
        self.push_key(KeyState::Owned(handle), name.into(), mode, Box::new(on_reopen))
    }

    /// Register a key whose handle belongs to another owner. It is not
    /// closed on yield; the reopen on resume replaces it with a handle this
    /// context owns from then on.
    ///
    /// # Panics
    ///
    /// Panics when called while the context does not hold the host lock.
    pub fn track_shared_key(
        &mut self,
        handle: KeyHandle,
        name: impl Into<Arc<str>>,
        mode: OpenMode,
        on_reopen: impl FnMut(Option<&KeyHandle>) + Send + 'static,
    ) -> KeyToken {
        self.push_key(
            KeyState::Borrowed(handle),
            name.into(),
            mode,
            Box::new(on_reopen),
        )
    }

    fn push_key(
        &mut self,
        state: KeyState,
        name: Arc<str>,
        mode: OpenMode,
        on_reopen: ReopenCallback,
    ) -> KeyToken {
        assert!(
            self.locked,
            "keys can only be tracked while the context holds the host lock"
        );
        self.keys.push(TrackedKey {
            state,
            name,
            mode,
            on_reopen,
        });
        KeyToken(self.keys.len() - 1)
    }

    /// The current handle for a tracked key. `None` while the context is
    /// unlocked, and `None` after a resume that found the key gone.
    pub fn handle(&self, token: KeyToken) -> Option<&KeyHandle> {
        if !self.locked {
            return None;
        }
        self.keys[token.0].state.handle()
    }

    /// The name a tracked key is reopened under.
    pub fn key_name(&self, token: KeyToken) -> &str {
        &self.keys[token.0].name
    }

    /// Acquire the host lock and reopen every tracked key.
    ///
    /// # Panics
    ///
    /// Panics when the context is already locked.
    pub fn lock(&mut self) {
        assert!(!self.locked, "context is already locked");
        self.host.lock();
        self.locked = true;
        self.reopen_keys();
    }

    /// Close every owned handle and release the host lock. Tracked entries
    /// survive; their handles do not.
    pub fn unlock(&mut self) {
        assert!(self.locked, "context is not locked");
        self.close_keys();
        self.host.unlock();
        self.locked = false;
    }

    /// Stamp the clock and zero the ticker.
    pub fn reset_clock(&mut self) {
        self.last_locked = Instant::now();
        self.ticker = 0;
    }

    /// Yield the host lock if the time budget has run out.
    ///
    /// Returns `true` when a yield happened: the lock was released and
    /// immediately reacquired, every tracked key reopened, and the clock
    /// reset. Reacquiring right away is enough on a contended lock (the
    /// kernel hands it to a waiting thread without an explicit yield
    /// syscall) and costs next to nothing on an uncontended one.
    ///
    /// # Panics
    ///
    /// Panics when called while the context does not hold the host lock.
    pub fn check_timer(&mut self) -> bool {
        assert!(self.locked, "check_timer requires the host lock");
        if self.last_locked.elapsed() <= YIELD_BUDGET {
            return false;
        }
        self.unlock();
        self.lock();
        self.reset_clock();
        true
    }

    /// Cheap per-iteration variant of [`SearchContext::check_timer`]: pays
    /// one counter increment per call and consults the clock every
    /// hundredth call.
    pub fn tick(&mut self) -> bool {
        self.ticker = self.ticker.wrapping_add(1);
        if self.ticker % TICK_CHECK_GRANULARITY == 0 {
            self.check_timer()
        } else {
            false
        }
    }

    fn reopen_keys(&mut self) {
        for key in &mut self.keys {
            let reopened = self.host.open_key(&key.name, key.mode);
            (key.on_reopen)(reopened.as_ref());
            key.state = match reopened {
                Some(handle) => KeyState::Owned(handle),
                None => KeyState::Closed,
            };
        }
    }

    fn close_keys(&mut self) {
        for key in &mut self.keys {
            match std::mem::replace(&mut key.state, KeyState::Closed) {
                KeyState::Owned(handle) => self.host.close_key(handle),
                borrowed @ KeyState::Borrowed(_) => key.state = borrowed,
                KeyState::Closed => {}
            }
        }
    }
}

impl Drop for SearchContext {
    fn drop(&mut self) {
        if self.locked {
            self.close_keys();
            self.host.unlock();
            self.locked = false;
        }
    }
}
