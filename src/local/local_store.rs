use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::auth::User;
use crate::error::StoreResult;
use crate::local::local_documents_view::LocalDocumentsView;
use crate::local::local_view_changes::LocalViewChanges;
use crate::local::lru_garbage_collector::{LruGarbageCollector, LruResults};
use crate::local::memory_persistence::MemoryPersistence;
use crate::local::mutation_queue::MemoryMutationQueue;
use crate::local::query_engine::QueryEngine;
use crate::local::remote_document_cache::MemoryRemoteDocumentCache;
use crate::local::target_cache::MemoryTargetCache;
use crate::local::target_data::{QueryPurpose, TargetData};
use crate::model::{
    Document, DocumentKey, MaybeDocument, Mutation, MutationBatch, MutationBatchResult,
    Precondition, SnapshotVersion, Timestamp,
};
use crate::query::{Query, Target};
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use crate::util::{fail, hard_assert};

/// Longest a resume token stays buffered before it is written out even
/// without membership changes. Keeps restart replays short without
/// persisting a token on every snapshot.
const RESUME_TOKEN_MAX_AGE_SECONDS: i64 = 300;

/// Outcome of locally applying a batch of user mutations.
pub struct LocalWriteResult {
    pub batch_id: i32,
    pub changes: BTreeMap<DocumentKey, MaybeDocument>,
}

/// Documents matching a query together with the keys the backend last
/// confirmed for its target.
pub struct QueryResult {
    pub documents: BTreeMap<DocumentKey, Document>,
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// Outcome of switching users: which pending batches disappeared, which
/// appeared, and the new local view of every document either side touched.
pub struct UserChangeResult {
    pub removed_batch_ids: Vec<i32>,
    pub added_batch_ids: Vec<i32>,
    pub affected_documents: BTreeMap<DocumentKey, MaybeDocument>,
}

struct LocalStoreState {
    mutation_queue: Arc<MemoryMutationQueue>,
    local_documents: Arc<LocalDocumentsView>,
    /// Targets the client is actively reasoning about, by target id.
    target_data_by_target: BTreeMap<i32, TargetData>,
}

/// Client-side bookkeeping between the remote layer and persistence.
///
/// All remote input (snapshots, write acknowledgements, rejections) and all
/// user input (mutations, query listens) funnel through here so the caches
/// and the mutation queue stay consistent with each other. Methods run
/// synchronously on the client's worker and wrap their work in a
/// persistence transaction.
pub struct LocalStore {
    persistence: Arc<MemoryPersistence>,
    remote_documents: Arc<MemoryRemoteDocumentCache>,
    target_cache: Arc<MemoryTargetCache>,
    query_engine: QueryEngine,
    state: Mutex<LocalStoreState>,
}

impl LocalStore {
    pub fn new(persistence: Arc<MemoryPersistence>, initial_user: &User) -> Self {
        let remote_documents = persistence.remote_document_cache();
        let target_cache = persistence.target_cache();
        let mutation_queue = persistence.get_mutation_queue(initial_user);
        let local_documents = Arc::new(LocalDocumentsView::new(
            remote_documents.clone(),
            mutation_queue.clone(),
        ));
        Self {
            persistence,
            remote_documents,
            target_cache,
            query_engine: QueryEngine::new(),
            state: Mutex::new(LocalStoreState {
                mutation_queue,
                local_documents,
                target_data_by_target: BTreeMap::new(),
            }),
        }
    }

    /// Swaps in the new user's mutation queue and reports every document
    /// whose local view may have changed because pending writes came or
    /// went with the user.
    pub fn handle_user_change(&self, user: &User) -> StoreResult<UserChangeResult> {
        self.persistence.run_transaction("Handle user change", |_txn| {
            let mut state = self.state.lock().unwrap();
            let old_batches = state.mutation_queue.all_mutation_batches();
            let new_queue = self.persistence.get_mutation_queue(user);
            state.mutation_queue = new_queue.clone();
            state.local_documents = Arc::new(LocalDocumentsView::new(
                self.remote_documents.clone(),
                new_queue.clone(),
            ));
            let new_batches = new_queue.all_mutation_batches();

            let mut changed_keys = BTreeSet::new();
            for batch in old_batches.iter().chain(new_batches.iter()) {
                changed_keys.extend(batch.keys());
            }
            let affected_documents = state.local_documents.get_documents(&changed_keys);
            Ok(UserChangeResult {
                removed_batch_ids: old_batches.iter().map(|b| b.batch_id).collect(),
                added_batch_ids: new_batches.iter().map(|b| b.batch_id).collect(),
                affected_documents,
            })
        })
    }

    /// Appends the mutations to the queue as one batch and computes the new
    /// local view of every touched document.
    ///
    /// Transforms that depend on the current document state (increments)
    /// pin their baseline with an extra base mutation, so replaying the
    /// batch against later server data cannot double-apply them.
    pub fn local_write(&self, mutations: Vec<Mutation>) -> StoreResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: BTreeSet<DocumentKey> =
            mutations.iter().map(|m| m.key().clone()).collect();
        self.persistence
            .run_transaction("Locally write mutations", |_txn| {
                let state = self.state.lock().unwrap();
                let mut existing_docs = state.local_documents.get_documents(&keys);

                let mut base_mutations = Vec::new();
                for mutation in &mutations {
                    let maybe_doc = existing_docs.get(mutation.key());
                    if let Some(base_value) = mutation.extract_base_value(maybe_doc) {
                        // The base mutation only applies when the document
                        // still exists; its mask restricts it to the fields
                        // whose baseline matters.
                        let mask = base_value.field_mask();
                        base_mutations.push(Mutation::Patch {
                            key: mutation.key().clone(),
                            data: base_value,
                            mask,
                            precondition: Precondition::Exists(true),
                        });
                    }
                }

                let batch = state.mutation_queue.add_mutation_batch(
                    local_write_time,
                    base_mutations,
                    mutations.clone(),
                );
                batch.apply_to_local_document_set(&mut existing_docs);
                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes: existing_docs,
                })
            })
    }

    /// Folds an acknowledged batch into the remote document cache, drops it
    /// from the queue and returns the resulting local view of its keys.
    pub fn acknowledge_batch(
        &self,
        batch_result: &MutationBatchResult,
    ) -> StoreResult<BTreeMap<DocumentKey, MaybeDocument>> {
        self.persistence.run_transaction("Acknowledge batch", |txn| {
            let state = self.state.lock().unwrap();
            let batch = &batch_result.batch;
            let affected_keys = batch.keys();

            for key in &affected_keys {
                let ack_version = match batch_result.doc_versions.get(key) {
                    Some(version) => *version,
                    None => fail("Attempted to apply a mutation batch without a version"),
                };
                let existing = self.remote_documents.get_entry(key);
                let outdated = existing
                    .as_ref()
                    .map(|doc| doc.version() < ack_version)
                    .unwrap_or(true);
                if outdated {
                    if let Some(doc) =
                        batch.apply_to_remote_document(key, existing, batch_result)
                    {
                        self.remote_documents
                            .add_entry(doc, batch_result.commit_version);
                    }
                }
            }

            state.mutation_queue.remove_mutation_batch(batch);
            state
                .mutation_queue
                .set_last_stream_token(batch_result.stream_token.clone());
            let delegate = self.persistence.reference_delegate();
            for key in &affected_keys {
                delegate.mark_potentially_orphaned(txn, key);
            }
            state.mutation_queue.perform_consistency_check();
            Ok(state.local_documents.get_documents(&affected_keys))
        })
    }

    /// Removes a batch the backend refused and returns the local view of
    /// its keys with the batch's effects gone.
    pub fn reject_batch(
        &self,
        batch_id: i32,
    ) -> StoreResult<BTreeMap<DocumentKey, MaybeDocument>> {
        self.persistence.run_transaction("Reject batch", |txn| {
            let state = self.state.lock().unwrap();
            let batch = state
                .mutation_queue
                .lookup_mutation_batch(batch_id)
                .unwrap_or_else(|| fail("Attempt to reject nonexistent batch!"));
            let affected_keys = batch.keys();

            state.mutation_queue.remove_mutation_batch(&batch);
            let delegate = self.persistence.reference_delegate();
            for key in &affected_keys {
                delegate.mark_potentially_orphaned(txn, key);
            }
            state.mutation_queue.perform_consistency_check();
            Ok(state.local_documents.get_documents(&affected_keys))
        })
    }

    pub fn get_last_stream_token(&self) -> Bytes {
        self.state.lock().unwrap().mutation_queue.last_stream_token()
    }

    pub fn set_last_stream_token(&self, stream_token: Bytes) -> StoreResult<()> {
        self.persistence
            .run_transaction("Set last stream token", |_txn| {
                self.state
                    .lock()
                    .unwrap()
                    .mutation_queue
                    .set_last_stream_token(stream_token);
                Ok(())
            })
    }

    /// The version up to which the client has a complete picture from the
    /// backend. Watch resumes from here after a restart.
    pub fn get_last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.target_cache.last_remote_snapshot_version()
    }

    /// Applies an aggregated watch snapshot: updates target membership and
    /// resume tokens, folds document updates into the cache (dropping ones
    /// the cache already supersedes) and returns the new local view of
    /// every changed document.
    pub fn apply_remote_event(
        &self,
        remote_event: &RemoteEvent,
    ) -> StoreResult<BTreeMap<DocumentKey, MaybeDocument>> {
        let remote_version = remote_event.snapshot_version;
        self.persistence.run_transaction("Apply remote event", |txn| {
            let mut state = self.state.lock().unwrap();
            let delegate = self.persistence.reference_delegate();

            // Membership and resume-token bookkeeping for targets that are
            // still allocated. Updates that arrive through such targets are
            // authoritative: the backend has told us the document belongs
            // in the target, so only pending local writes may override it.
            let mut authoritative_updates: BTreeSet<DocumentKey> = BTreeSet::new();
            for (&target_id, change) in &remote_event.target_changes {
                let old_target_data =
                    match state.target_data_by_target.get(&target_id) {
                        Some(data) => data.clone(),
                        None => continue,
                    };

                authoritative_updates.extend(change.added_documents.iter().cloned());
                authoritative_updates.extend(change.modified_documents.iter().cloned());

                self.target_cache
                    .remove_matching_keys(&change.removed_documents, target_id);
                for key in &change.removed_documents {
                    delegate.remove_reference(txn, target_id, key);
                }
                self.target_cache
                    .add_matching_keys(&change.added_documents, target_id);
                for key in &change.added_documents {
                    delegate.add_reference(txn, target_id, key);
                }

                if !change.resume_token.is_empty() {
                    let new_target_data = old_target_data
                        .clone()
                        .with_resume_token(change.resume_token.clone(), remote_version)
                        .with_sequence_number(txn.current_sequence_number());
                    state
                        .target_data_by_target
                        .insert(target_id, new_target_data.clone());
                    if should_persist_target_data(&old_target_data, &new_target_data, change)
                    {
                        self.target_cache.update_target_data(new_target_data);
                    }
                }
            }

            let mut changed_docs: BTreeMap<DocumentKey, MaybeDocument> = BTreeMap::new();
            let existing_docs = self
                .remote_documents
                .get_entries(remote_event.document_updates.keys().cloned());
            for (key, doc) in &remote_event.document_updates {
                let existing = existing_docs.get(key).and_then(|entry| entry.clone());
                let should_apply = match &existing {
                    None => true,
                    Some(existing_doc) => {
                        doc.version() == SnapshotVersion::min()
                            || (authoritative_updates.contains(key)
                                && !existing_doc.has_pending_writes())
                            || doc.version() >= existing_doc.version()
                    }
                };
                if should_apply {
                    self.remote_documents.add_entry(doc.clone(), remote_version);
                    changed_docs.insert(key.clone(), doc.clone());
                } else {
                    log::debug!(
                        "LocalStore: Ignoring outdated watch update for {}. Current version: {:?} Watch version: {:?}",
                        key,
                        existing.as_ref().map(|d| d.version()),
                        doc.version()
                    );
                }
            }
            for key in &remote_event.resolved_limbo_documents {
                delegate.update_limbo_document(txn, key);
            }

            if remote_version != SnapshotVersion::min() {
                let last_remote_version = self.target_cache.last_remote_snapshot_version();
                hard_assert(
                    remote_version >= last_remote_version,
                    "Watch stream reverted to previous snapshot?",
                );
                self.target_cache.set_last_remote_snapshot_version(remote_version);
            }

            let base = changed_docs
                .into_iter()
                .map(|(key, doc)| (key, Some(doc)))
                .collect();
            Ok(state.local_documents.get_local_view_of_documents(base))
        })
    }

    /// Records which documents each view now holds, and notes targets that
    /// reached a limbo-free snapshot so later query executions can resume
    /// from their previous results.
    pub fn notify_local_view_changes(
        &self,
        view_changes: Vec<LocalViewChanges>,
    ) -> StoreResult<()> {
        self.persistence
            .run_transaction("Notify local view changes", |txn| {
                let delegate = self.persistence.reference_delegate();
                for view_change in &view_changes {
                    for key in &view_change.added_keys {
                        delegate.add_reference(txn, view_change.target_id, key);
                    }
                    for key in &view_change.removed_keys {
                        delegate.remove_reference(txn, view_change.target_id, key);
                    }
                }
                Ok(())
            })?;

        let mut state = self.state.lock().unwrap();
        for view_change in &view_changes {
            if view_change.from_cache {
                continue;
            }
            if let Some(target_data) =
                state.target_data_by_target.get(&view_change.target_id)
            {
                let limbo_free_version = target_data.snapshot_version;
                let updated = target_data
                    .clone()
                    .with_last_limbo_free_snapshot_version(limbo_free_version);
                state
                    .target_data_by_target
                    .insert(view_change.target_id, updated);
            }
        }
        Ok(())
    }

    pub fn next_mutation_batch(&self, after_batch_id: i32) -> Option<MutationBatch> {
        self.state
            .lock()
            .unwrap()
            .mutation_queue
            .next_mutation_batch_after_batch_id(after_batch_id)
    }

    /// Batch id of the newest pending write, or [`BATCH_ID_UNKNOWN`] when
    /// the queue is empty.
    ///
    /// [`BATCH_ID_UNKNOWN`]: crate::model::BATCH_ID_UNKNOWN
    pub fn get_highest_unacknowledged_batch_id(&self) -> i32 {
        self.state
            .lock()
            .unwrap()
            .mutation_queue
            .highest_unacknowledged_batch_id()
    }

    pub fn read_document(&self, key: &DocumentKey) -> Option<MaybeDocument> {
        self.state.lock().unwrap().local_documents.get_document(key)
    }

    /// Returns the target data under which the given target is tracked,
    /// reusing cached data for a previously listened-to target.
    pub fn allocate_target(&self, target: Target) -> StoreResult<TargetData> {
        let target_data = self.persistence.run_transaction("Allocate target", |txn| {
            if let Some(cached) = self.target_cache.get_target_data(&target) {
                return Ok(cached);
            }
            let target_id = self.target_cache.allocate_target_id();
            let data = TargetData::new(
                target.clone(),
                target_id,
                txn.current_sequence_number(),
                QueryPurpose::Listen,
            );
            self.target_cache.add_target_data(data.clone());
            Ok(data)
        })?;

        let mut state = self.state.lock().unwrap();
        hard_assert(
            !state
                .target_data_by_target
                .contains_key(&target_data.target_id),
            "Tried to allocate an already allocated target",
        );
        state
            .target_data_by_target
            .insert(target_data.target_id, target_data.clone());
        Ok(target_data)
    }

    /// Releases a target. With `keep_persisted` the cached target data
    /// survives (the LRU delegate also does this on removal, with a bumped
    /// sequence number); without it the eager delegate drops the target's
    /// documents unless something else holds them.
    pub fn release_target(&self, target_id: i32, keep_persisted: bool) -> StoreResult<()> {
        let target_data = self
            .state
            .lock()
            .unwrap()
            .target_data_by_target
            .get(&target_id)
            .cloned()
            .unwrap_or_else(|| fail("Tried to release nonexistent target"));

        self.persistence.run_transaction("Release target", |txn| {
            if !keep_persisted {
                self.persistence
                    .reference_delegate()
                    .remove_target(txn, &target_data);
            }
            Ok(())
        })?;
        self.state
            .lock()
            .unwrap()
            .target_data_by_target
            .remove(&target_id);
        Ok(())
    }

    /// Runs the query against the local view. With `use_previous_results`
    /// the engine may start from the target's previous results instead of
    /// scanning the whole collection.
    pub fn execute_query(
        &self,
        query: &Query,
        use_previous_results: bool,
    ) -> StoreResult<QueryResult> {
        self.persistence.run_transaction("Execute query", |_txn| {
            let state = self.state.lock().unwrap();
            let mut last_limbo_free_snapshot_version = SnapshotVersion::min();
            let mut remote_keys = BTreeSet::new();
            if let Some(target_data) = self.target_cache.get_target_data(&query.to_target())
            {
                last_limbo_free_snapshot_version =
                    target_data.last_limbo_free_snapshot_version;
                remote_keys = self
                    .target_cache
                    .matching_keys_for_target_id(target_data.target_id);
            }
            let empty_keys = BTreeSet::new();
            let documents = self.query_engine.get_documents_matching_query(
                &state.local_documents,
                query,
                if use_previous_results {
                    last_limbo_free_snapshot_version
                } else {
                    SnapshotVersion::min()
                },
                if use_previous_results {
                    &remote_keys
                } else {
                    &empty_keys
                },
            );
            Ok(QueryResult {
                documents,
                remote_keys,
            })
        })
    }

    /// The keys the backend last confirmed for the target.
    pub fn remote_document_keys(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.target_cache.matching_keys_for_target_id(target_id)
    }

    pub fn collect_garbage(
        &self,
        garbage_collector: &LruGarbageCollector,
    ) -> StoreResult<LruResults> {
        self.persistence.run_transaction("Collect garbage", |txn| {
            let active_target_ids: BTreeSet<i32> = self
                .state
                .lock()
                .unwrap()
                .target_data_by_target
                .keys()
                .copied()
                .collect();
            Ok(garbage_collector.collect(txn, &active_target_ids))
        })
    }
}

/// Whether the new resume token is worth a cache write. Tokens are cheap to
/// receive but not to persist, so unchanged-membership updates are only
/// written through once the buffered token gets old.
fn should_persist_target_data(
    old_target_data: &TargetData,
    new_target_data: &TargetData,
    change: &TargetChange,
) -> bool {
    hard_assert(
        !new_target_data.resume_token.is_empty(),
        "Attempted to persist target data with an empty resume token",
    );
    if old_target_data.resume_token.is_empty() {
        return true;
    }
    let time_delta = new_target_data.snapshot_version.timestamp().seconds
        - old_target_data.snapshot_version.timestamp().seconds;
    if time_delta >= RESUME_TOKEN_MAX_AGE_SECONDS {
        return true;
    }
    let membership_changes = change.added_documents.len()
        + change.modified_documents.len()
        + change.removed_documents.len();
    membership_changes > 0
}
