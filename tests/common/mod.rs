#![allow(dead_code)]

//! Shared fixtures for the scenario tests.

use griddle::error::{GriddleError, Result};
use griddle::indexing::{DocumentContext, IndexBatch, IndexSpec, Indexer, MatchAttributes};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `ready` until it holds or `deadline` passes.
pub fn wait_until(deadline: Duration, mut ready: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if ready() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    ready()
}

/// Document pipeline stand-in that records every interaction.
#[derive(Default)]
pub struct RecordingIndexer {
    pub begun: Mutex<Vec<String>>,
    pub prepared: Mutex<Vec<String>>,
    pub committed: AtomicUsize,
    pub discarded: AtomicUsize,
    /// Keys whose prepare step fails.
    pub reject: Vec<String>,
    /// When set, prepare blocks until [`RecordingIndexer::open_gate`].
    pub gate: Option<Arc<(Mutex<bool>, Condvar)>>,
}

impl RecordingIndexer {
    pub fn gated() -> (Arc<Self>, Arc<(Mutex<bool>, Condvar)>) {
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let indexer = Arc::new(Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        });
        (indexer, gate)
    }

    pub fn open_gate(gate: &Arc<(Mutex<bool>, Condvar)>) {
        let (open, cond) = &**gate;
        *open.lock().unwrap() = true;
        cond.notify_all();
    }

    pub fn prepared_keys(&self) -> Vec<String> {
        self.prepared.lock().unwrap().clone()
    }
}

pub struct RecordingBatch {
    indexer: Arc<RecordingIndexer>,
}

/// Local newtype so `Indexer` (foreign to this integration-test crate) can
/// be implemented for an `Arc<RecordingIndexer>` handle without running
/// afoul of the orphan rules.
pub struct RecordingIndexerHandle(pub Arc<RecordingIndexer>);

impl Indexer for RecordingIndexerHandle {
    fn begin(&self, spec: &Arc<IndexSpec>) -> Box<dyn IndexBatch> {
        self.0.begun.lock().unwrap().push(spec.name().to_string());
        Box::new(RecordingBatch {
            indexer: Arc::clone(&self.0),
        })
    }
}

impl IndexBatch for RecordingBatch {
    fn prepare(&mut self, key: &str, _attrs: &MatchAttributes) -> Result<DocumentContext> {
        if let Some(gate) = &self.indexer.gate {
            let (open, cond) = &**gate;
            let mut open = open.lock().unwrap();
            while !*open {
                open = cond.wait(open).unwrap();
            }
        }
        if self.indexer.reject.iter().any(|k| k == key) {
            return Err(GriddleError::DocumentRejected {
                key: key.to_string(),
                reason: "rejected by fixture".into(),
            });
        }
        self.indexer.prepared.lock().unwrap().push(key.to_string());
        Ok(Box::new(key.to_string()))
    }

    fn add(&mut self, _doc: DocumentContext) -> Result<()> {
        Ok(())
    }

    fn commit(self: Box<Self>) {
        self.indexer.committed.fetch_add(1, Ordering::SeqCst);
    }

    fn discard(self: Box<Self>) {
        self.indexer.discarded.fetch_add(1, Ordering::SeqCst);
    }
}
