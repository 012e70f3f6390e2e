//! The asynchronous indexing queue.
//!
//! All indexes share one dedicated worker thread. Submissions land in the
//! target index's own sub-queue, keyed by document key; the worker wakes on
//! an interval, or early when a sub-queue reaches the batch size, picks the
//! deepest sub-queue, swaps its live dict out under the locks, and drains
//! the swapped batch with the host lock taken per document. A sub-queue
//! that refilled while it was being drained goes straight back on the
//! pending list.
//!
//! Each sub-queue hangs off its [`IndexSpec`], so a dropped-and-recreated
//! index starts from an empty queue; the pending list holds an
//! `Arc<IndexSpec>` per queued index, which is what keeps a spec alive
//! while work for it is outstanding.
//!
//! Lock order, top-down: pending-list mutex, then sub-queue mutex, then
//! host lock.

use super::{IndexSpec, Indexer, IndexableDocument, MatchAttributes};
use crate::host::Host;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// The per-index sub-queue: the mutex-guarded live dict and drain-state
/// flags. Owned by the [`IndexSpec`] it serves.
pub(super) struct SpecDocQueue {
    inner: Mutex<SdqInner>,
}

#[derive(Default)]
struct SdqInner {
    entries: HashMap<Arc<str>, IndexableDocument>,
    /// On the global pending list, waiting for the worker.
    pending: bool,
    /// A swapped-out batch of this queue is being drained right now.
    processing: bool,
    /// Size of the batch currently being drained, 0 otherwise.
    nactive: usize,
}

impl SpecDocQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SdqInner::default()),
        })
    }

    fn live_len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

/// The sub-queue of a spec that is on the pending list or mid-drain.
/// Submission initializes the slot before the spec can get there.
fn doc_queue(spec: &IndexSpec) -> &Arc<SpecDocQueue> {
    spec.queue
        .get()
        .expect("a pending spec always has a doc queue")
}

struct PendingList {
    queues: Vec<Arc<IndexSpec>>,
    cancelled: bool,
}

struct QueueShared {
    interval: Duration,
    batch_size: usize,
    host: Arc<dyn Host>,
    indexer: Arc<dyn Indexer>,
    pending: Mutex<PendingList>,
    wakeup: Condvar,
}

/// Handle to the shared indexing queue. Dropping it cancels the worker and
/// joins it; work still queued is not drained, and each sub-queue's
/// records are released with the index that owns them.
pub struct AsyncIndexQueue {
    shared: Arc<QueueShared>,
    worker: Option<JoinHandle<()>>,
}

impl AsyncIndexQueue {
    /// Spawn the dedicated indexing worker.
    pub fn start(
        interval: Duration,
        batch_size: usize,
        host: Arc<dyn Host>,
        indexer: Arc<dyn Indexer>,
    ) -> Self {
        let shared = Arc::new(QueueShared {
            interval,
            batch_size,
            host,
            indexer,
            pending: Mutex::new(PendingList {
                queues: Vec::new(),
                cancelled: false,
            }),
            wakeup: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("griddle-index-queue".into())
            .spawn(move || worker_shared.run())
            .expect("failed to spawn indexing worker");
        tracing::info!(
            interval_ms = interval.as_millis() as u64,
            batch_size,
            "Indexing queue started"
        );
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Queue one document mutation for `spec`. Typically called with the
    /// host lock held; never waits on the worker.
    ///
    /// A key already queued for this index is left as-is and the new
    /// submission is dropped; the document is re-read at indexing time
    /// anyway, so the latest state wins.
    pub fn submit(&self, spec: &Arc<IndexSpec>, attrs: MatchAttributes, key: Arc<str>) {
        let dq = Arc::clone(spec.queue.get_or_init(SpecDocQueue::new));
        let doc = IndexableDocument {
            key: Arc::clone(&key),
            attrs,
        };

        let was_processing;
        let queued;
        {
            let mut pending = self.shared.pending.lock().unwrap();
            let mut q = dq.inner.lock().unwrap();
            match q.entries.entry(key) {
                Entry::Occupied(_) => return,
                Entry::Vacant(slot) => {
                    slot.insert(doc);
                }
            }
            was_processing = q.processing;
            queued = q.entries.len();
            if !q.pending && !q.processing {
                tracing::debug!(spec = spec.name(), "queueing index for a pending drain");
                pending.queues.push(Arc::clone(spec));
                q.pending = true;
            }
        }

        if !was_processing && queued >= self.shared.batch_size {
            tracing::debug!(
                spec = spec.name(),
                queued,
                "batch threshold reached, waking the worker"
            );
            self.shared.wakeup.notify_one();
        }
    }

    /// Documents still outstanding for `spec`: the batch being drained plus
    /// the live dict. `None` when this spec instance never had anything
    /// queued (a recreated index does not inherit its predecessor's count).
    pub fn pending_count(&self, spec: &IndexSpec) -> Option<usize> {
        let dq = Arc::clone(spec.queue.get()?);
        let _pending = self.shared.pending.lock().unwrap();
        let q = dq.inner.lock().unwrap();
        Some(q.nactive + q.entries.len())
    }
}

impl Drop for AsyncIndexQueue {
    fn drop(&mut self) {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.cancelled = true;
        }
        self.shared.wakeup.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl QueueShared {
    fn run(&self) {
        loop {
            let (spec, dq, batch) = {
                let mut pending = self.pending.lock().unwrap();
                loop {
                    // Cancellation is re-checked on every wakeup, spurious
                    // or timed out.
                    if pending.cancelled {
                        if !pending.queues.is_empty() {
                            tracing::debug!(
                                dropped = pending.queues.len(),
                                "indexing queue cancelled with batches still pending"
                            );
                        }
                        return;
                    }
                    if !pending.queues.is_empty() {
                        break;
                    }
                    let (guard, _timed_out) = self
                        .wakeup
                        .wait_timeout(pending, self.interval)
                        .unwrap();
                    pending = guard;
                }

                // Deepest queue first: indexes under sustained write
                // pressure must not accumulate unbounded lag. Sort
                // ascending and take the tail so removal is a swap.
                pending
                    .queues
                    .sort_by_cached_key(|spec| doc_queue(spec).live_len());
                let last = pending.queues.len() - 1;
                let spec = pending.queues.swap_remove(last);
                let dq = Arc::clone(doc_queue(&spec));

                let batch = {
                    let mut q = dq.inner.lock().unwrap();
                    let entries = std::mem::take(&mut q.entries);
                    q.nactive = entries.len();
                    q.processing = true;
                    q.pending = false;
                    entries
                };
                (spec, dq, batch)
            };

            self.index_batch(&spec, &dq, batch);
            // The worker's own reference to the spec lapses here unless the
            // requeue in index_batch took a new one.
        }
    }

    fn index_batch(
        &self,
        spec: &Arc<IndexSpec>,
        dq: &SpecDocQueue,
        entries: HashMap<Arc<str>, IndexableDocument>,
    ) {
        tracing::debug!(spec = spec.name(), size = entries.len(), "draining batch");
        let mut batch = self.indexer.begin(spec);

        for (_key, doc) in entries {
            if spec.is_deleted() {
                break;
            }
            self.host.lock();
            let prepared = batch.prepare(&doc.key, &doc.attrs);
            self.host.unlock();
            let prepared = match prepared {
                Ok(prepared) => prepared,
                Err(e) => {
                    tracing::warn!(key = %doc.key, error = %e, "failed to prepare document");
                    continue;
                }
            };
            if let Err(e) = batch.add(prepared) {
                tracing::warn!(key = %doc.key, error = %e, "failed to index document");
            }
            // The retained key is released as `doc` goes out of scope.
        }

        self.host.lock();
        if spec.is_deleted() {
            tracing::debug!(spec = spec.name(), "index deleted mid-drain, discarding batch");
            batch.discard();
        } else {
            batch.commit();
        }
        self.host.unlock();

        // Put the spec back on the pending list if submissions arrived
        // while we were draining; otherwise the reference taken at submit
        // time has lapsed and the spec is free to go.
        let mut pending = self.pending.lock().unwrap();
        let mut q = dq.inner.lock().unwrap();
        q.processing = false;
        q.nactive = 0;
        if !q.entries.is_empty() {
            q.pending = true;
            pending.queues.push(Arc::clone(spec));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GriddleError, Result};
    use crate::host::sim::SimHost;
    use crate::indexing::{DocumentContext, IndexBatch};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    /// Records every pipeline interaction so tests can assert on ordering
    /// and counts.
    #[derive(Default)]
    struct RecordingIndexer {
        begun: Mutex<Vec<String>>,
        prepared: Mutex<Vec<String>>,
        committed: AtomicUsize,
        discarded: AtomicUsize,
        /// Keys whose prepare step should fail.
        reject: Vec<String>,
        /// When set, prepare blocks until the gate opens.
        gate: Option<Arc<(Mutex<bool>, Condvar)>>,
    }

    struct RecordingBatch {
        indexer: Arc<RecordingIndexer>,
    }

    impl Indexer for Arc<RecordingIndexer> {
        fn begin(&self, spec: &Arc<IndexSpec>) -> Box<dyn IndexBatch> {
            self.begun.lock().unwrap().push(spec.name().to_string());
            Box::new(RecordingBatch {
                indexer: Arc::clone(self),
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
                    reason: "rejected by test".into(),
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

    fn start_queue(
        interval: Duration,
        batch_size: usize,
        indexer: Arc<RecordingIndexer>,
    ) -> AsyncIndexQueue {
        let host: Arc<dyn Host> = Arc::new(SimHost::new());
        AsyncIndexQueue::start(interval, batch_size, host, Arc::new(indexer))
    }

    fn wait_until(deadline: Duration, mut ready: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if ready() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        ready()
    }

    #[test]
    fn duplicate_keys_collapse_to_one_entry() {
        let indexer = Arc::new(RecordingIndexer::default());
        // Interval long enough that nothing drains during the test.
        let queue = start_queue(Duration::from_secs(60), 100, Arc::clone(&indexer));
        let spec = IndexSpec::new("products");

        queue.submit(&spec, MatchAttributes::default(), Arc::from("k1"));
        queue.submit(&spec, MatchAttributes::default(), Arc::from("k1"));
        queue.submit(&spec, MatchAttributes::default(), Arc::from("k2"));

        assert_eq!(queue.pending_count(&spec), Some(2));
    }

    #[test]
    fn pending_count_is_none_without_submissions() {
        let indexer = Arc::new(RecordingIndexer::default());
        let queue = start_queue(Duration::from_secs(60), 100, Arc::clone(&indexer));
        let spec = IndexSpec::new("untouched");
        assert_eq!(queue.pending_count(&spec), None);
    }

    #[test]
    fn reaching_batch_size_wakes_the_worker_early() {
        let indexer = Arc::new(RecordingIndexer::default());
        let queue = start_queue(Duration::from_secs(60), 3, Arc::clone(&indexer));
        let spec = IndexSpec::new("products");

        queue.submit(&spec, MatchAttributes::default(), Arc::from("k1"));
        queue.submit(&spec, MatchAttributes::default(), Arc::from("k2"));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(
            queue.pending_count(&spec),
            Some(2),
            "below the batch size nothing should drain before the interval"
        );

        queue.submit(&spec, MatchAttributes::default(), Arc::from("k3"));
        assert!(
            wait_until(Duration::from_secs(2), || queue.pending_count(&spec) == Some(0)),
            "third submission must trigger an early drain"
        );
        assert_eq!(indexer.prepared.lock().unwrap().len(), 3);
        assert_eq!(indexer.committed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn interval_expiry_drains_small_batches() {
        let indexer = Arc::new(RecordingIndexer::default());
        let queue = start_queue(Duration::from_millis(50), 100, Arc::clone(&indexer));
        let spec = IndexSpec::new("products");

        queue.submit(&spec, MatchAttributes::default(), Arc::from("k1"));
        assert!(
            wait_until(Duration::from_secs(2), || queue.pending_count(&spec) == Some(0)),
            "a lone document drains once the interval expires"
        );
        assert_eq!(*indexer.prepared.lock().unwrap(), vec!["k1".to_string()]);
    }

    #[test]
    fn deepest_queue_is_drained_first() {
        let indexer = Arc::new(RecordingIndexer::default());
        let queue = start_queue(Duration::from_millis(150), 100, Arc::clone(&indexer));
        let deep = IndexSpec::new("deep");
        let shallow = IndexSpec::new("shallow");

        queue.submit(&shallow, MatchAttributes::default(), Arc::from("s1"));
        for i in 0..5 {
            queue.submit(&deep, MatchAttributes::default(), Arc::from(format!("d{i}").as_str()));
        }

        assert!(wait_until(Duration::from_secs(3), || {
            queue.pending_count(&deep) == Some(0) && queue.pending_count(&shallow) == Some(0)
        }));
        let begun = indexer.begun.lock().unwrap();
        assert_eq!(*begun, vec!["deep".to_string(), "shallow".to_string()]);
    }

    #[test]
    fn deleted_spec_discards_instead_of_committing() {
        let indexer = Arc::new(RecordingIndexer::default());
        let queue = start_queue(Duration::from_millis(50), 100, Arc::clone(&indexer));
        let spec = IndexSpec::new("doomed");

        // Deleted before the worker can possibly drain, so the whole batch
        // must take the discard path.
        spec.mark_deleted();
        queue.submit(&spec, MatchAttributes::default(), Arc::from("k1"));
        queue.submit(&spec, MatchAttributes::default(), Arc::from("k2"));

        assert!(wait_until(Duration::from_secs(2), || {
            indexer.discarded.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(indexer.prepared.lock().unwrap().len(), 0);
        assert_eq!(indexer.committed.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending_count(&spec), Some(0));
    }

    #[test]
    fn submit_after_index_recreated_with_same_name_targets_the_new_spec() {
        let indexer = Arc::new(RecordingIndexer::default());
        let queue = start_queue(Duration::from_millis(50), 100, Arc::clone(&indexer));

        let old = IndexSpec::new("products");
        old.mark_deleted();
        queue.submit(&old, MatchAttributes::default(), Arc::from("stale"));

        // Routine drop-then-recreate: same name, different index.
        let new = IndexSpec::new("products");
        assert_eq!(
            queue.pending_count(&new),
            None,
            "a recreated index must not inherit its predecessor's queue"
        );

        queue.submit(&new, MatchAttributes::default(), Arc::from("fresh"));
        assert!(wait_until(Duration::from_secs(2), || {
            indexer.committed.load(Ordering::SeqCst) == 1
                && indexer.discarded.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(
            *indexer.prepared.lock().unwrap(),
            vec!["fresh".to_string()],
            "the new index's document must be indexed, not discarded with the old one"
        );
        assert_eq!(queue.pending_count(&new), Some(0));
    }

    #[test]
    fn rejected_documents_are_skipped_and_the_rest_commit() {
        let indexer = Arc::new(RecordingIndexer {
            reject: vec!["bad".to_string()],
            ..RecordingIndexer::default()
        });
        let queue = start_queue(Duration::from_millis(50), 100, Arc::clone(&indexer));
        let spec = IndexSpec::new("products");

        queue.submit(&spec, MatchAttributes::default(), Arc::from("bad"));
        queue.submit(&spec, MatchAttributes::default(), Arc::from("good"));

        assert!(wait_until(Duration::from_secs(2), || {
            indexer.committed.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(*indexer.prepared.lock().unwrap(), vec!["good".to_string()]);
    }

    #[test]
    fn submissions_during_a_drain_requeue_the_index() {
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let indexer = Arc::new(RecordingIndexer {
            gate: Some(Arc::clone(&gate)),
            ..RecordingIndexer::default()
        });
        let queue = start_queue(Duration::from_secs(60), 1, Arc::clone(&indexer));
        let spec = IndexSpec::new("products");

        // First submission hits the batch size and starts a drain that
        // parks inside prepare.
        queue.submit(&spec, MatchAttributes::default(), Arc::from("k1"));
        assert!(wait_until(Duration::from_secs(2), || {
            indexer.begun.lock().unwrap().len() == 1
        }));

        // While the drain is parked, a new document lands in the live dict:
        // one active plus one live.
        queue.submit(&spec, MatchAttributes::default(), Arc::from("k2"));
        assert_eq!(queue.pending_count(&spec), Some(2));

        {
            let (open, cond) = &*gate;
            *open.lock().unwrap() = true;
            cond.notify_all();
        }

        assert!(
            wait_until(Duration::from_secs(2), || queue.pending_count(&spec) == Some(0)),
            "the refilled queue must be drained again without a new signal"
        );
        assert_eq!(
            *indexer.prepared.lock().unwrap(),
            vec!["k1".to_string(), "k2".to_string()]
        );
        assert_eq!(indexer.begun.lock().unwrap().len(), 2);
    }

    #[test]
    fn cancelling_with_pending_work_releases_everything() {
        let indexer = Arc::new(RecordingIndexer::default());
        let queue = start_queue(Duration::from_secs(60), 100, Arc::clone(&indexer));
        let spec = IndexSpec::new("products");
        let key: Arc<str> = Arc::from("k1");

        queue.submit(&spec, MatchAttributes::default(), Arc::clone(&key));
        drop(queue);

        assert_eq!(indexer.prepared.lock().unwrap().len(), 0, "nothing drained");
        assert_eq!(
            Arc::strong_count(&spec),
            1,
            "the pending-list reference on the spec must lapse"
        );

        // The undrained record now lives only in the spec's own sub-queue
        // and goes away with the index.
        drop(spec);
        assert_eq!(
            Arc::strong_count(&key),
            1,
            "the queued record's key retain must be released on teardown"
        );
    }

    #[test]
    fn idle_worker_survives_many_interval_expirations() {
        let indexer = Arc::new(RecordingIndexer::default());
        let queue = start_queue(Duration::from_millis(10), 100, Arc::clone(&indexer));
        std::thread::sleep(Duration::from_millis(100));
        // Nothing was ever submitted; the worker just kept waiting.
        drop(queue);
        assert_eq!(indexer.begun.lock().unwrap().len(), 0);
    }
}
