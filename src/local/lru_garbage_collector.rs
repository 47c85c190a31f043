use std::collections::{BTreeSet, BinaryHeap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::local::listen_sequence::{ListenSequence, ListenSequenceNumber};
use crate::local::local_store::LocalStore;
use crate::local::persistence::{LruDelegate, PersistenceTransaction};
use crate::util::{box_queue_future, AsyncQueue, DelayedOperation, TimerId};

/// Sentinel threshold that turns collection off entirely.
pub const COLLECTION_DISABLED: i64 = -1;

const INITIAL_GC_DELAY: Duration = Duration::from_secs(60);
const REGULAR_GC_DELAY: Duration = Duration::from_secs(300);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LruParams {
    /// Cache size above which a collection pass actually runs.
    pub cache_size_collection_threshold_bytes: i64,
    /// Percentage of tracked sequence numbers to collect per pass.
    pub percentile_to_collect: i32,
    /// Hard cap on sequence numbers collected in a single pass.
    pub maximum_sequence_numbers_to_collect: usize,
}

impl LruParams {
    pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;
    pub const MINIMUM_CACHE_SIZE_BYTES: i64 = 1024 * 1024;

    pub fn with_cache_size(cache_size_bytes: i64) -> Self {
        Self {
            cache_size_collection_threshold_bytes: cache_size_bytes,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self::with_cache_size(COLLECTION_DISABLED)
    }
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            cache_size_collection_threshold_bytes: Self::DEFAULT_CACHE_SIZE_BYTES,
            percentile_to_collect: 10,
            maximum_sequence_numbers_to_collect: 1000,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

impl LruResults {
    pub fn did_not_run() -> Self {
        Self::default()
    }
}

/// Keeps the `max_elements` smallest sequence numbers offered to it. The
/// largest retained value is then the nth smallest overall, which becomes
/// the collection upper bound.
struct RollingSequenceNumberBuffer {
    // Max-heap: the root is the largest of the kept values and the first
    // to be evicted when a smaller candidate arrives.
    buffer: BinaryHeap<ListenSequenceNumber>,
    max_elements: usize,
}

impl RollingSequenceNumberBuffer {
    fn new(max_elements: usize) -> Self {
        Self {
            buffer: BinaryHeap::new(),
            max_elements,
        }
    }

    fn add_element(&mut self, sequence_number: ListenSequenceNumber) {
        if self.buffer.len() < self.max_elements {
            self.buffer.push(sequence_number);
        } else if let Some(&largest) = self.buffer.peek() {
            if sequence_number < largest {
                self.buffer.pop();
                self.buffer.push(sequence_number);
            }
        }
    }

    fn max_value(&self) -> ListenSequenceNumber {
        match self.buffer.peek() {
            Some(&value) => value,
            None => ListenSequence::INVALID,
        }
    }
}

/// Removes the least recently used targets and the documents orphaned below
/// them. A pass only runs once the cache outgrows the configured threshold;
/// each pass collects a percentile of the tracked sequence numbers, capped.
pub struct LruGarbageCollector {
    params: LruParams,
    delegate: Arc<dyn LruDelegate>,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams, delegate: Arc<dyn LruDelegate>) -> Self {
        Self { params, delegate }
    }

    pub fn collect(
        &self,
        txn: &PersistenceTransaction,
        active_target_ids: &BTreeSet<i32>,
    ) -> LruResults {
        if self.params.cache_size_collection_threshold_bytes == COLLECTION_DISABLED {
            log::debug!("LruGarbageCollector: Garbage collection skipped; disabled");
            return LruResults::did_not_run();
        }
        let cache_size = self.delegate.cache_byte_size() as i64;
        if cache_size < self.params.cache_size_collection_threshold_bytes {
            log::debug!(
                "LruGarbageCollector: Garbage collection skipped; Cache size {} is lower than threshold {}",
                cache_size,
                self.params.cache_size_collection_threshold_bytes
            );
            return LruResults::did_not_run();
        }
        self.run_garbage_collection(txn, active_target_ids)
    }

    fn run_garbage_collection(
        &self,
        txn: &PersistenceTransaction,
        active_target_ids: &BTreeSet<i32>,
    ) -> LruResults {
        let sequence_number_count = self.delegate.sequence_number_count();
        let calculated =
            sequence_number_count * self.params.percentile_to_collect as usize / 100;
        let sequence_numbers_to_collect =
            if calculated > self.params.maximum_sequence_numbers_to_collect {
                log::debug!(
                    "LruGarbageCollector: Capped sequence numbers to collect down to the maximum of {} from {}",
                    self.params.maximum_sequence_numbers_to_collect,
                    calculated
                );
                self.params.maximum_sequence_numbers_to_collect
            } else {
                calculated
            };
        let upper_bound = self.nth_sequence_number(sequence_numbers_to_collect);
        let targets_removed = self
            .delegate
            .remove_targets(txn, upper_bound, active_target_ids);
        let documents_removed = self.delegate.remove_orphaned_documents(txn, upper_bound);
        log::debug!(
            "LruGarbageCollector: Removed {} targets and {} documents at or below sequence number {}",
            targets_removed,
            documents_removed,
            upper_bound
        );
        LruResults {
            did_run: true,
            sequence_numbers_collected: sequence_numbers_to_collect,
            targets_removed,
            documents_removed,
        }
    }

    /// The nth smallest sequence number across targets and orphaned
    /// documents, or [`ListenSequence::INVALID`] when `n` is zero.
    fn nth_sequence_number(&self, n: usize) -> ListenSequenceNumber {
        if n == 0 {
            return ListenSequence::INVALID;
        }
        let mut buffer = RollingSequenceNumberBuffer::new(n);
        self.delegate
            .for_each_target(&mut |target_data| buffer.add_element(target_data.sequence_number));
        self.delegate
            .for_each_orphaned_document_sequence_number(&mut |sequence_number| {
                buffer.add_element(sequence_number)
            });
        buffer.max_value()
    }
}

struct SchedulerState {
    started: bool,
    has_run: bool,
    delayed_operation: Option<DelayedOperation>,
}

/// Drives periodic collection passes on the shared worker queue: the first
/// pass shortly after startup, later passes on a regular cadence.
pub struct LruScheduler {
    queue: Arc<AsyncQueue>,
    collector: Arc<LruGarbageCollector>,
    state: Mutex<SchedulerState>,
}

impl LruScheduler {
    pub fn new(queue: Arc<AsyncQueue>, collector: Arc<LruGarbageCollector>) -> Self {
        Self {
            queue,
            collector,
            state: Mutex::new(SchedulerState {
                started: false,
                has_run: false,
                delayed_operation: None,
            }),
        }
    }

    pub fn start(self: &Arc<Self>, local_store: Arc<LocalStore>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.started {
                return;
            }
            state.started = true;
        }
        self.schedule(local_store);
    }

    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.started = false;
        if let Some(operation) = state.delayed_operation.take() {
            operation.cancel();
        }
    }

    pub fn started(&self) -> bool {
        self.state.lock().unwrap().started
    }

    fn schedule(self: &Arc<Self>, local_store: Arc<LocalStore>) {
        let delay = {
            let state = self.state.lock().unwrap();
            if !state.started {
                return;
            }
            if state.has_run {
                REGULAR_GC_DELAY
            } else {
                INITIAL_GC_DELAY
            }
        };
        log::debug!("LruScheduler: Garbage collection scheduled in {:?}", delay);
        let scheduler = Arc::clone(self);
        let operation = self.queue.enqueue_after_delay(
            TimerId::GarbageCollectionDelay,
            delay,
            move || {
                box_queue_future(async move {
                    let results = local_store.collect_garbage(&scheduler.collector)?;
                    if results.did_run {
                        log::debug!(
                            "LruScheduler: Collected {} sequence numbers",
                            results.sequence_numbers_collected
                        );
                    }
                    scheduler.state.lock().unwrap().has_run = true;
                    scheduler.schedule(local_store);
                    Ok(())
                })
            },
        );
        self.state.lock().unwrap().delayed_operation = Some(operation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::memory_persistence::MemoryLruDelegate;
    use crate::local::mutation_queue::MemoryMutationQueue;
    use crate::local::persistence::ReferenceDelegate;
    use crate::local::remote_document_cache::MemoryRemoteDocumentCache;
    use crate::local::target_cache::MemoryTargetCache;
    use crate::local::target_data::{QueryPurpose, TargetData};
    use crate::model::{
        Document, DocumentKey, DocumentState, ObjectValue, ResourcePath, SnapshotVersion,
        Timestamp,
    };
    use crate::query::Query;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn rolling_buffer_keeps_the_smallest_sequence_numbers() {
        let mut buffer = RollingSequenceNumberBuffer::new(3);
        for sequence_number in [9, 2, 7, 1, 8, 4] {
            buffer.add_element(sequence_number);
        }
        // The three smallest are 1, 2 and 4; the bound is the largest kept.
        assert_eq!(buffer.max_value(), 4);
    }

    #[test]
    fn rolling_buffer_is_invalid_when_empty() {
        let buffer = RollingSequenceNumberBuffer::new(5);
        assert_eq!(buffer.max_value(), ListenSequence::INVALID);
    }

    fn lru_fixture() -> (
        Arc<MemoryLruDelegate>,
        Arc<MemoryTargetCache>,
        Arc<MemoryRemoteDocumentCache>,
    ) {
        let queues = Arc::new(Mutex::new(BTreeMap::<
            crate::auth::User,
            Arc<MemoryMutationQueue>,
        >::new()));
        let remote_documents = Arc::new(MemoryRemoteDocumentCache::new());
        let target_cache = Arc::new(MemoryTargetCache::new());
        let delegate = Arc::new(MemoryLruDelegate::new(
            queues,
            remote_documents.clone(),
            target_cache.clone(),
        ));
        (delegate, target_cache, remote_documents)
    }

    fn add_target(cache: &MemoryTargetCache, path: &str, sequence_number: i64) -> TargetData {
        let target = Query::at_path(ResourcePath::from_string(path).unwrap()).to_target();
        let data = TargetData::new(
            target,
            cache.allocate_target_id(),
            sequence_number,
            QueryPurpose::Listen,
        );
        cache.add_target_data(data.clone());
        data
    }

    fn add_document(cache: &MemoryRemoteDocumentCache, path: &str) -> DocumentKey {
        let key = DocumentKey::from_string(path).unwrap();
        let doc = Document::new(
            key.clone(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            ObjectValue::from_json(json!({"padding": "x"})).unwrap(),
            DocumentState::Synced,
        );
        cache.add_entry(doc.into(), SnapshotVersion::new(Timestamp::new(1, 0)));
        key
    }

    #[test]
    fn collection_is_skipped_below_the_size_threshold() {
        let (delegate, _targets, _documents) = lru_fixture();
        let collector =
            LruGarbageCollector::new(LruParams::with_cache_size(1_000_000), delegate);
        let results =
            collector.collect(&PersistenceTransaction::new(1), &BTreeSet::new());
        assert!(!results.did_run);
    }

    #[test]
    fn collection_is_skipped_when_disabled() {
        let (delegate, targets, documents) = lru_fixture();
        add_target(&targets, "rooms", 1);
        add_document(&documents, "rooms/a");
        let collector = LruGarbageCollector::new(LruParams::disabled(), delegate);
        let results =
            collector.collect(&PersistenceTransaction::new(1), &BTreeSet::new());
        assert!(!results.did_run);
    }

    #[test]
    fn collection_removes_the_oldest_targets_and_their_orphans() {
        let (delegate, targets, documents) = lru_fixture();
        for (index, path) in ["rooms", "halls", "desks", "walls"].iter().enumerate() {
            add_target(&targets, path, index as i64 + 2);
        }
        let orphan = add_document(&documents, "rooms/orphan");
        delegate.mark_potentially_orphaned(&PersistenceTransaction::new(1), &orphan);

        // Five sequence numbers tracked (orphan at 1, targets at 2..=5);
        // collect 40% of them.
        let params = LruParams {
            cache_size_collection_threshold_bytes: 0,
            percentile_to_collect: 40,
            maximum_sequence_numbers_to_collect: 1000,
        };
        let collector = LruGarbageCollector::new(params, delegate);
        let results =
            collector.collect(&PersistenceTransaction::new(9), &BTreeSet::new());

        assert!(results.did_run);
        assert_eq!(results.sequence_numbers_collected, 2);
        // Upper bound lands on sequence number 2: the orphan and the oldest
        // target go, the rest stay.
        assert_eq!(results.targets_removed, 1);
        assert_eq!(results.documents_removed, 1);
        assert_eq!(targets.target_count(), 3);
    }

    #[test]
    fn active_targets_survive_collection() {
        let (delegate, targets, _documents) = lru_fixture();
        let old = add_target(&targets, "rooms", 1);
        add_target(&targets, "halls", 2);

        let params = LruParams {
            cache_size_collection_threshold_bytes: 0,
            percentile_to_collect: 100,
            maximum_sequence_numbers_to_collect: 1000,
        };
        let collector = LruGarbageCollector::new(params, delegate);
        let active: BTreeSet<i32> = [old.target_id].into_iter().collect();
        let results = collector.collect(&PersistenceTransaction::new(9), &active);

        assert!(results.did_run);
        assert_eq!(results.targets_removed, 1);
        assert_eq!(targets.target_count(), 1);
        assert!(targets
            .get_target_data(&old.target)
            .is_some());
    }

    #[test]
    fn caps_the_number_of_sequence_numbers_collected() {
        let (delegate, targets, _documents) = lru_fixture();
        for index in 0..30 {
            add_target(&targets, &format!("c{index}"), index as i64 + 1);
        }
        let params = LruParams {
            cache_size_collection_threshold_bytes: 0,
            percentile_to_collect: 100,
            maximum_sequence_numbers_to_collect: 5,
        };
        let collector = LruGarbageCollector::new(params, delegate);
        let results =
            collector.collect(&PersistenceTransaction::new(99), &BTreeSet::new());
        assert_eq!(results.sequence_numbers_collected, 5);
        assert_eq!(results.targets_removed, 5);
    }
}
