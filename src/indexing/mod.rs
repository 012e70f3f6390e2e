//! Document indexing support: the minimal surface of an index schema the
//! queue needs, the attributes a matched document carries, and the seam to
//! the external document-analysis pipeline.

pub mod queue;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Identity and lifecycle flag of one search index. The schema and data
/// structures behind it live elsewhere; the core only needs to name the
/// index, to notice when it is deleted mid-drain, and to hang the index's
/// document sub-queue off it.
///
/// The sub-queue belongs to this spec instance, not to the index name:
/// dropping an index and recreating one under the same name yields a fresh,
/// empty queue.
pub struct IndexSpec {
    name: String,
    deleted: AtomicBool,
    queue: OnceLock<Arc<queue::SpecDocQueue>>,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            deleted: AtomicBool::new(false),
            queue: OnceLock::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Flag the index as deleted. Queued work for it is discarded instead
    /// of committed.
    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for IndexSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSpec")
            .field("name", &self.name)
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

/// Attributes the matching phase attaches to a document before it is
/// queued: which analyzer language applies, an optional score override,
/// and a free-form payload stored alongside the document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// One queued mutation: the retained document key plus its match
/// attributes.
#[derive(Debug, Clone)]
pub struct IndexableDocument {
    pub key: Arc<str>,
    pub attrs: MatchAttributes,
}

/// Opaque per-document analysis state produced under the host lock and
/// consumed by the batch outside it.
pub type DocumentContext = Box<dyn Any + Send>;

/// Factory for per-drain batches. Implemented by the external
/// document-analysis pipeline.
pub trait Indexer: Send + Sync + 'static {
    fn begin(&self, spec: &Arc<IndexSpec>) -> Box<dyn IndexBatch>;
}

/// One drain cycle's worth of analysis work for a single index.
pub trait IndexBatch: Send {
    /// Build the analysis context for one document. Called with the host
    /// lock held.
    fn prepare(&mut self, key: &str, attrs: &MatchAttributes) -> Result<DocumentContext>;

    /// Feed a prepared document into the batch. Called without the host
    /// lock; a failed document is dropped and the batch continues.
    fn add(&mut self, doc: DocumentContext) -> Result<()>;

    /// Commit everything fed so far. Called with the host lock held.
    fn commit(self: Box<Self>);

    /// Throw away everything fed so far (the index is gone). Called with
    /// the host lock held.
    fn discard(self: Box<Self>);
}
