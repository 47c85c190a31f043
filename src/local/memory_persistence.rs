use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use crate::auth::User;
use crate::error::StoreResult;
use crate::local::listen_sequence::{ListenSequence, ListenSequenceNumber};
use crate::local::lru_garbage_collector::{LruGarbageCollector, LruParams};
use crate::local::mutation_queue::MemoryMutationQueue;
use crate::local::persistence::{LruDelegate, PersistenceTransaction, ReferenceDelegate};
use crate::local::reference_set::ReferenceSet;
use crate::local::remote_document_cache::MemoryRemoteDocumentCache;
use crate::local::target_cache::MemoryTargetCache;
use crate::local::target_data::TargetData;
use crate::model::DocumentKey;

type MutationQueueRegistry = Arc<Mutex<BTreeMap<User, Arc<MemoryMutationQueue>>>>;

/// In-memory persistence: one mutation queue per user plus the shared
/// document and target caches, with all state dropped when the client goes
/// away. Reference accounting runs through the configured delegate, which
/// determines whether cached documents are collected eagerly or by the LRU
/// collector.
pub struct MemoryPersistence {
    mutation_queues: MutationQueueRegistry,
    remote_documents: Arc<MemoryRemoteDocumentCache>,
    target_cache: Arc<MemoryTargetCache>,
    reference_delegate: Arc<dyn ReferenceDelegate>,
    listen_sequence: Mutex<ListenSequence>,
}

impl MemoryPersistence {
    /// Persistence that drops cache entries as soon as the last interested
    /// party lets go of them.
    pub fn with_eager_garbage_collection() -> Arc<Self> {
        let queues: MutationQueueRegistry = Arc::new(Mutex::new(BTreeMap::new()));
        let remote_documents = Arc::new(MemoryRemoteDocumentCache::new());
        let target_cache = Arc::new(MemoryTargetCache::new());
        let delegate = Arc::new(MemoryEagerDelegate::new(
            queues.clone(),
            remote_documents.clone(),
            target_cache.clone(),
        ));
        Arc::new(Self::new(queues, remote_documents, target_cache, delegate))
    }

    /// Persistence that keeps cache entries until the LRU collector decides
    /// they have aged out. Returns the collector so the client can schedule
    /// it.
    pub fn with_lru_garbage_collection(
        params: LruParams,
    ) -> (Arc<Self>, Arc<LruGarbageCollector>) {
        let queues: MutationQueueRegistry = Arc::new(Mutex::new(BTreeMap::new()));
        let remote_documents = Arc::new(MemoryRemoteDocumentCache::new());
        let target_cache = Arc::new(MemoryTargetCache::new());
        let delegate = Arc::new(MemoryLruDelegate::new(
            queues.clone(),
            remote_documents.clone(),
            target_cache.clone(),
        ));
        let collector = Arc::new(LruGarbageCollector::new(params, delegate.clone()));
        let persistence = Arc::new(Self::new(
            queues,
            remote_documents,
            target_cache,
            delegate,
        ));
        (persistence, collector)
    }

    fn new(
        mutation_queues: MutationQueueRegistry,
        remote_documents: Arc<MemoryRemoteDocumentCache>,
        target_cache: Arc<MemoryTargetCache>,
        reference_delegate: Arc<dyn ReferenceDelegate>,
    ) -> Self {
        let starting_after = target_cache.highest_sequence_number();
        Self {
            mutation_queues,
            remote_documents,
            target_cache,
            reference_delegate,
            listen_sequence: Mutex::new(ListenSequence::new(starting_after)),
        }
    }

    /// Runs `f` as a transaction: the delegate observes the start, the
    /// closure does its work with a fresh sequence number, and on success
    /// the delegate gets to react to the commit (the eager delegate sweeps
    /// orphaned documents here).
    pub fn run_transaction<T>(
        &self,
        label: &str,
        f: impl FnOnce(&PersistenceTransaction) -> StoreResult<T>,
    ) -> StoreResult<T> {
        log::debug!("MemoryPersistence: Starting transaction: {label}");
        let sequence_number = self.listen_sequence.lock().unwrap().next();
        let txn = PersistenceTransaction::new(sequence_number);
        self.reference_delegate.on_transaction_started(&txn);
        let result = f(&txn)?;
        self.reference_delegate.on_transaction_committed(&txn);
        Ok(result)
    }

    pub fn get_mutation_queue(&self, user: &User) -> Arc<MemoryMutationQueue> {
        self.mutation_queues
            .lock()
            .unwrap()
            .entry(user.clone())
            .or_insert_with(|| Arc::new(MemoryMutationQueue::new()))
            .clone()
    }

    pub fn remote_document_cache(&self) -> Arc<MemoryRemoteDocumentCache> {
        self.remote_documents.clone()
    }

    pub fn target_cache(&self) -> Arc<MemoryTargetCache> {
        self.target_cache.clone()
    }

    pub fn reference_delegate(&self) -> Arc<dyn ReferenceDelegate> {
        self.reference_delegate.clone()
    }
}

fn any_queue_contains_key(queues: &MutationQueueRegistry, key: &DocumentKey) -> bool {
    queues
        .lock()
        .unwrap()
        .values()
        .any(|queue| queue.contains_key(key))
}

fn pins_contain_key(
    pins: &Mutex<Option<Arc<Mutex<ReferenceSet>>>>,
    key: &DocumentKey,
) -> bool {
    match pins.lock().unwrap().as_ref() {
        Some(pins) => pins.lock().unwrap().contains_key(key),
        None => false,
    }
}

/// Tracks documents that became potentially unreferenced during the current
/// transaction and removes them from the cache at commit time unless some
/// target, mutation or in-memory pin still needs them.
pub struct MemoryEagerDelegate {
    mutation_queues: MutationQueueRegistry,
    remote_documents: Arc<MemoryRemoteDocumentCache>,
    target_cache: Arc<MemoryTargetCache>,
    orphaned: Mutex<BTreeSet<DocumentKey>>,
    in_memory_pins: Mutex<Option<Arc<Mutex<ReferenceSet>>>>,
}

impl MemoryEagerDelegate {
    pub fn new(
        mutation_queues: MutationQueueRegistry,
        remote_documents: Arc<MemoryRemoteDocumentCache>,
        target_cache: Arc<MemoryTargetCache>,
    ) -> Self {
        Self {
            mutation_queues,
            remote_documents,
            target_cache,
            orphaned: Mutex::new(BTreeSet::new()),
            in_memory_pins: Mutex::new(None),
        }
    }

    fn is_referenced(&self, key: &DocumentKey) -> bool {
        self.target_cache.contains_key(key)
            || any_queue_contains_key(&self.mutation_queues, key)
            || pins_contain_key(&self.in_memory_pins, key)
    }
}

impl ReferenceDelegate for MemoryEagerDelegate {
    fn on_transaction_started(&self, _txn: &PersistenceTransaction) {
        self.orphaned.lock().unwrap().clear();
    }

    fn on_transaction_committed(&self, _txn: &PersistenceTransaction) {
        let orphaned = std::mem::take(&mut *self.orphaned.lock().unwrap());
        for key in orphaned {
            if !self.is_referenced(&key) {
                self.remote_documents.remove_entry(&key);
            }
        }
    }

    fn add_reference(&self, _txn: &PersistenceTransaction, _target_id: i32, key: &DocumentKey) {
        self.orphaned.lock().unwrap().remove(key);
    }

    fn remove_reference(&self, _txn: &PersistenceTransaction, _target_id: i32, key: &DocumentKey) {
        self.orphaned.lock().unwrap().insert(key.clone());
    }

    fn mark_potentially_orphaned(&self, _txn: &PersistenceTransaction, key: &DocumentKey) {
        self.orphaned.lock().unwrap().insert(key.clone());
    }

    fn remove_target(&self, _txn: &PersistenceTransaction, target_data: &TargetData) {
        let keys = self
            .target_cache
            .matching_keys_for_target_id(target_data.target_id);
        self.orphaned.lock().unwrap().extend(keys);
        self.target_cache.remove_target_data(target_data);
    }

    fn update_limbo_document(&self, _txn: &PersistenceTransaction, key: &DocumentKey) {
        if self.is_referenced(key) {
            self.orphaned.lock().unwrap().remove(key);
        } else {
            self.orphaned.lock().unwrap().insert(key.clone());
        }
    }

    fn set_in_memory_pins(&self, pins: Arc<Mutex<ReferenceSet>>) {
        *self.in_memory_pins.lock().unwrap() = Some(pins);
    }
}

/// Stamps every reference event with the transaction's sequence number so
/// the LRU collector can later order documents and targets by recency.
/// Released targets are kept in the cache with a bumped sequence number
/// rather than removed.
pub struct MemoryLruDelegate {
    mutation_queues: MutationQueueRegistry,
    remote_documents: Arc<MemoryRemoteDocumentCache>,
    target_cache: Arc<MemoryTargetCache>,
    orphaned_sequence_numbers: Mutex<BTreeMap<DocumentKey, ListenSequenceNumber>>,
    in_memory_pins: Mutex<Option<Arc<Mutex<ReferenceSet>>>>,
}

impl MemoryLruDelegate {
    pub fn new(
        mutation_queues: MutationQueueRegistry,
        remote_documents: Arc<MemoryRemoteDocumentCache>,
        target_cache: Arc<MemoryTargetCache>,
    ) -> Self {
        Self {
            mutation_queues,
            remote_documents,
            target_cache,
            orphaned_sequence_numbers: Mutex::new(BTreeMap::new()),
            in_memory_pins: Mutex::new(None),
        }
    }

    fn record_sequence_number(&self, txn: &PersistenceTransaction, key: &DocumentKey) {
        self.orphaned_sequence_numbers
            .lock()
            .unwrap()
            .insert(key.clone(), txn.current_sequence_number());
    }

    /// A document is pinned when something still references it, or when its
    /// last recorded activity is newer than the collection bound.
    fn is_pinned_at(&self, key: &DocumentKey, upper_bound: ListenSequenceNumber) -> bool {
        if any_queue_contains_key(&self.mutation_queues, key)
            || pins_contain_key(&self.in_memory_pins, key)
            || self.target_cache.contains_key(key)
        {
            return true;
        }
        match self.orphaned_sequence_numbers.lock().unwrap().get(key) {
            Some(sequence_number) => *sequence_number > upper_bound,
            None => false,
        }
    }
}

impl ReferenceDelegate for MemoryLruDelegate {
    fn on_transaction_started(&self, _txn: &PersistenceTransaction) {}

    fn on_transaction_committed(&self, _txn: &PersistenceTransaction) {}

    fn add_reference(&self, txn: &PersistenceTransaction, _target_id: i32, key: &DocumentKey) {
        self.record_sequence_number(txn, key);
    }

    fn remove_reference(&self, txn: &PersistenceTransaction, _target_id: i32, key: &DocumentKey) {
        self.record_sequence_number(txn, key);
    }

    fn mark_potentially_orphaned(&self, txn: &PersistenceTransaction, key: &DocumentKey) {
        self.record_sequence_number(txn, key);
    }

    fn remove_target(&self, txn: &PersistenceTransaction, target_data: &TargetData) {
        let updated = target_data
            .clone()
            .with_sequence_number(txn.current_sequence_number());
        self.target_cache.update_target_data(updated);
    }

    fn update_limbo_document(&self, txn: &PersistenceTransaction, key: &DocumentKey) {
        self.record_sequence_number(txn, key);
    }

    fn set_in_memory_pins(&self, pins: Arc<Mutex<ReferenceSet>>) {
        *self.in_memory_pins.lock().unwrap() = Some(pins);
    }
}

impl LruDelegate for MemoryLruDelegate {
    fn for_each_target(&self, f: &mut dyn FnMut(&TargetData)) {
        self.target_cache.for_each_target(|target_data| f(target_data));
    }

    fn sequence_number_count(&self) -> usize {
        let mut orphaned = 0;
        self.for_each_orphaned_document_sequence_number(&mut |_| orphaned += 1);
        self.target_cache.target_count() + orphaned
    }

    fn for_each_orphaned_document_sequence_number(
        &self,
        f: &mut dyn FnMut(ListenSequenceNumber),
    ) {
        let entries: Vec<(DocumentKey, ListenSequenceNumber)> = self
            .orphaned_sequence_numbers
            .lock()
            .unwrap()
            .iter()
            .map(|(key, sequence_number)| (key.clone(), *sequence_number))
            .collect();
        for (key, sequence_number) in entries {
            // Using the entry's own sequence number as the bound ignores
            // recency and reports the document unless it is referenced.
            if !self.is_pinned_at(&key, sequence_number) {
                f(sequence_number);
            }
        }
    }

    fn remove_targets(
        &self,
        _txn: &PersistenceTransaction,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<i32>,
    ) -> usize {
        self.target_cache.remove_targets(upper_bound, active_target_ids)
    }

    fn remove_orphaned_documents(
        &self,
        _txn: &PersistenceTransaction,
        upper_bound: ListenSequenceNumber,
    ) -> usize {
        let mut removed = 0;
        for key in self.remote_documents.keys() {
            if !self.is_pinned_at(&key, upper_bound) {
                self.remote_documents.remove_entry(&key);
                self.orphaned_sequence_numbers.lock().unwrap().remove(&key);
                removed += 1;
            }
        }
        removed
    }

    fn cache_byte_size(&self) -> usize {
        self.remote_documents.byte_size()
    }
}
