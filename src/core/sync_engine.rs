//! The glue between the local store, the remote store and the views.
//!
//! The sync engine owns every active view, decides what the union of local
//! and remote state means for each of them, and tracks limbo documents:
//! documents a view still holds even though no watch target accounts for
//! them. Each limbo document gets its own single-document listen so the
//! backend can either deliver its current version or confirm the delete.
//!
//! All methods run on the worker queue. Nothing here raises events
//! directly to user code; snapshots and errors go through the registered
//! [`SyncEngineListener`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use futures::channel::oneshot;
use once_cell::sync::OnceCell;

use crate::auth::User;
use crate::core::types::OnlineState;
use crate::core::view::{LimboDocumentChange, View};
use crate::core::view_snapshot::ViewSnapshot;
use crate::error::{cancelled, StoreError, StoreResult};
use crate::local::{
    ListenSequence, LocalStore, LocalViewChanges, QueryPurpose, ReferenceSet, TargetData,
    TargetIdGenerator,
};
use crate::model::{
    DocumentKey, MaybeDocument, Mutation, MutationBatchResult, NoDocument, SnapshotVersion,
    BATCH_ID_UNKNOWN,
};
use crate::query::Query;
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use crate::remote::remote_syncer::{box_remote_store_future, RemoteStoreFuture, RemoteSyncer};
use crate::remote::RemoteStore;
use crate::util::assert::{fail, hard_assert};

/// How many limbo documents may have an active listen at once. Documents
/// past the bound wait in a FIFO queue for a slot.
pub(crate) const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

/// Callbacks the sync engine raises toward the event layer.
///
/// Calls arrive on the worker queue with no engine locks held, so an
/// implementation may call back into the engine.
pub trait SyncEngineListener: Send + Sync + 'static {
    /// New snapshots, one per view that changed.
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);

    /// A listen failed permanently. The query's view is already gone when
    /// this fires.
    fn on_watch_error(&self, query: &Query, error: StoreError);

    /// The aggregate online state changed.
    fn on_online_state_change(&self, online_state: OnlineState);
}

/// An active query and the view computing its snapshots.
struct QueryView {
    target_id: i32,
    view: View,
}

/// State of one limbo document lookup.
struct LimboResolution {
    key: DocumentKey,
    /// Set once the limbo target delivered any version of the document.
    /// A target that goes current without this means the backend has no
    /// document, and the aggregator synthesizes the delete.
    received_document: bool,
}

/// Limbo listen/unlisten work decided while the engine state lock was
/// held, sent to the remote store once it is released.
#[derive(Default)]
struct LimboTargetRequests {
    listens: Vec<TargetData>,
    unlistens: Vec<i32>,
}

struct SyncEngineState {
    /// Active views keyed by query canonical id.
    query_views_by_query: BTreeMap<String, QueryView>,
    /// The queries served by each target. Mirrored limit queries share a
    /// target, so this is a list.
    queries_by_target: BTreeMap<i32, Vec<Query>>,
    /// Limbo documents waiting for a listen slot, in discovery order.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, i32>,
    active_limbo_resolutions_by_target: BTreeMap<i32, LimboResolution>,
    /// Which query targets keep which limbo documents alive. A limbo listen
    /// ends only when the last referencing target lets go.
    limbo_document_refs: ReferenceSet,
    limbo_target_id_generator: TargetIdGenerator,
    /// Write acknowledgement callbacks, per user, ordered by batch id.
    mutation_callbacks: BTreeMap<User, BTreeMap<i32, oneshot::Sender<StoreResult<()>>>>,
    /// Callbacks waiting for all writes up to a batch id to settle.
    pending_writes_callbacks: BTreeMap<i32, Vec<oneshot::Sender<StoreResult<()>>>>,
    online_state: OnlineState,
    current_user: User,
}

pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: OnceCell<RemoteStore>,
    /// Held weakly: the event layer owns the engine, so a strong reference
    /// here would form a cycle.
    listener: OnceCell<Weak<dyn SyncEngineListener>>,
    max_concurrent_limbo_resolutions: usize,
    state: Mutex<SyncEngineState>,
}

impl SyncEngine {
    pub fn new(
        local_store: Arc<LocalStore>,
        user: User,
        max_concurrent_limbo_resolutions: usize,
    ) -> Arc<Self> {
        Arc::new(SyncEngine {
            local_store,
            remote_store: OnceCell::new(),
            listener: OnceCell::new(),
            max_concurrent_limbo_resolutions,
            state: Mutex::new(SyncEngineState {
                query_views_by_query: BTreeMap::new(),
                queries_by_target: BTreeMap::new(),
                enqueued_limbo_resolutions: VecDeque::new(),
                active_limbo_targets_by_key: BTreeMap::new(),
                active_limbo_resolutions_by_target: BTreeMap::new(),
                limbo_document_refs: ReferenceSet::new(),
                limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
                mutation_callbacks: BTreeMap::new(),
                pending_writes_callbacks: BTreeMap::new(),
                online_state: OnlineState::Unknown,
                current_user: user,
            }),
        })
    }

    /// Wires in the remote store after construction. The remote store needs
    /// the engine as its syncer, so the two are built in sequence and
    /// joined here before use.
    pub fn attach_remote_store(&self, remote_store: RemoteStore) {
        if self.remote_store.set(remote_store).is_err() {
            fail("Remote store attached twice");
        }
    }

    /// Registers the event layer. Must happen before the first listen.
    pub fn subscribe(&self, listener: Weak<dyn SyncEngineListener>) {
        if self.listener.set(listener).is_err() {
            fail("Sync engine listener subscribed twice");
        }
    }

    fn remote_store(&self) -> &RemoteStore {
        match self.remote_store.get() {
            Some(remote_store) => remote_store,
            None => fail("Sync engine used before the remote store was attached"),
        }
    }

    /// A gone listener means the client is tearing down; events are
    /// dropped rather than failed.
    fn listener(&self) -> Option<Arc<dyn SyncEngineListener>> {
        match self.listener.get() {
            Some(listener) => listener.upgrade(),
            None => fail("Sync engine used before a listener subscribed"),
        }
    }

    /// Starts listening to a query and returns its first snapshot, computed
    /// from the local cache. Later snapshots flow through the listener.
    pub async fn listen(&self, query: Query) -> StoreResult<ViewSnapshot> {
        let canonical_id = query.canonical_id();
        let reused = {
            let state = self.state.lock().unwrap();
            state
                .query_views_by_query
                .get(&canonical_id)
                .map(|query_view| query_view.view.compute_initial_snapshot())
        };
        if let Some(snapshot) = reused {
            return Ok(snapshot);
        }

        let target = query.to_target();
        let target_canonical_id = target.canonical_id();
        // A mirrored limit query may already hold this target; the new view
        // shares it instead of allocating a second one.
        let shared_target_id = {
            let state = self.state.lock().unwrap();
            state
                .queries_by_target
                .iter()
                .find_map(|(target_id, queries)| {
                    let shared = queries
                        .iter()
                        .any(|other| other.to_target().canonical_id() == target_canonical_id);
                    if shared {
                        Some(*target_id)
                    } else {
                        None
                    }
                })
        };
        if let Some(target_id) = shared_target_id {
            let (snapshot, requests) = self.initialize_view(query, target_id)?;
            self.apply_limbo_requests(requests).await?;
            return Ok(snapshot);
        }

        let target_data = self.local_store.allocate_target(target)?;
        let (snapshot, requests) = self.initialize_view(query, target_data.target_id)?;
        self.apply_limbo_requests(requests).await?;
        self.remote_store().listen(target_data).await?;
        Ok(snapshot)
    }

    /// Builds and registers the view for a newly listened query from
    /// whatever the cache holds.
    fn initialize_view(
        &self,
        query: Query,
        target_id: i32,
    ) -> StoreResult<(ViewSnapshot, LimboTargetRequests)> {
        let query_result = self.local_store.execute_query(&query, true)?;
        let documents: BTreeMap<DocumentKey, MaybeDocument> = query_result
            .documents
            .into_iter()
            .map(|(key, document)| (key, MaybeDocument::from(document)))
            .collect();

        let mut view = View::new(query.clone(), query_result.remote_keys);
        let computed = view.compute_doc_changes(&documents, None);
        // A fresh view starts non-current; the watch stream confirms it.
        let target_change = TargetChange::synthesized_current_change(false);
        let view_change = view.apply_changes(computed, true, Some(&target_change));
        let snapshot = match view_change.snapshot {
            Some(snapshot) => snapshot,
            None => fail("Applying the initial documents must produce a snapshot"),
        };

        let mut requests = LimboTargetRequests::default();
        let mut state = self.state.lock().unwrap();
        self.update_tracked_limbos(
            &mut state,
            view_change.limbo_changes,
            target_id,
            &mut requests,
        );
        state
            .query_views_by_query
            .insert(query.canonical_id(), QueryView { target_id, view });
        state
            .queries_by_target
            .entry(target_id)
            .or_default()
            .push(query);
        Ok((snapshot, requests))
    }

    /// Stops listening to a query, releasing its target when it was the
    /// last query mapped to it.
    pub async fn unlisten(&self, query: &Query) -> StoreResult<()> {
        let canonical_id = query.canonical_id();
        let target_id = {
            let mut state = self.state.lock().unwrap();
            let target_id = match state.query_views_by_query.get(&canonical_id) {
                Some(query_view) => query_view.target_id,
                None => fail("Unlisten on a query that is not listened to"),
            };
            let queries = match state.queries_by_target.get_mut(&target_id) {
                Some(queries) => queries,
                None => fail("Missing queries for an active target"),
            };
            if queries.len() > 1 {
                // The mirrored twin keeps the target alive; only this view
                // goes away.
                queries.retain(|other| other.canonical_id() != canonical_id);
                state.query_views_by_query.remove(&canonical_id);
                return Ok(());
            }
            target_id
        };

        self.local_store.release_target(target_id, false)?;
        self.remote_store().unlisten(target_id).await?;
        let (_, requests) = self.remove_and_cleanup_target(target_id, None);
        self.apply_limbo_requests(requests).await
    }

    /// Persists mutations locally, queues them for the backend and raises
    /// the locally applied changes. `ack` completes once the backend
    /// acknowledges or permanently rejects the batch; a persistence failure
    /// rejects it immediately.
    pub async fn write(
        &self,
        mutations: Vec<Mutation>,
        ack: oneshot::Sender<StoreResult<()>>,
    ) -> StoreResult<()> {
        let result = match self.local_store.local_write(mutations) {
            Ok(result) => result,
            Err(error) => {
                let _ = ack.send(Err(error));
                return Ok(());
            }
        };
        {
            let mut state = self.state.lock().unwrap();
            let user = state.current_user.clone();
            state
                .mutation_callbacks
                .entry(user)
                .or_default()
                .insert(result.batch_id, ack);
        }
        self.emit_new_snaps_and_notify_local_store(result.changes, None)
            .await?;
        self.remote_store().fill_write_pipeline().await
    }

    /// Completes `callback` once every batch outstanding right now has
    /// been acknowledged or rejected. Completes immediately when the queue
    /// is empty, and fails with `Cancelled` if the user changes first.
    pub fn register_pending_writes_callback(&self, callback: oneshot::Sender<StoreResult<()>>) {
        let highest_batch_id = self.local_store.get_highest_unacknowledged_batch_id();
        let mut state = self.state.lock().unwrap();
        if state.online_state == OnlineState::Offline {
            log::debug!(
                "SyncEngine: network is disabled, pending writes can only settle once it is enabled"
            );
        }
        if highest_batch_id == BATCH_ID_UNKNOWN {
            let _ = callback.send(Ok(()));
            return;
        }
        state
            .pending_writes_callbacks
            .entry(highest_batch_id)
            .or_default()
            .push(callback);
    }

    /// Reruns every view under the new online state. Going offline drops
    /// `current`, so synced views re-raise their snapshot as from-cache.
    pub fn apply_online_state_change(&self, online_state: OnlineState) {
        let snapshots = {
            let mut state = self.state.lock().unwrap();
            let mut snapshots = Vec::new();
            for query_view in state.query_views_by_query.values_mut() {
                let view_change = query_view.view.apply_online_state_change(online_state);
                hard_assert(
                    view_change.limbo_changes.is_empty(),
                    "Online state changes cannot affect limbo documents",
                );
                if let Some(snapshot) = view_change.snapshot {
                    snapshots.push(snapshot);
                }
            }
            state.online_state = online_state;
            snapshots
        };
        if let Some(listener) = self.listener() {
            listener.on_online_state_change(online_state);
            if !snapshots.is_empty() {
                listener.on_watch_change(snapshots);
            }
        }
    }

    async fn apply_remote_event_impl(&self, event: RemoteEvent) -> StoreResult<()> {
        let changes = self.local_store.apply_remote_event(&event)?;
        {
            let mut state = self.state.lock().unwrap();
            for (target_id, target_change) in &event.target_changes {
                let resolution = match state.active_limbo_resolutions_by_target.get_mut(target_id)
                {
                    Some(resolution) => resolution,
                    None => continue,
                };
                // A limbo target watches a single document, so a change can
                // carry at most one of added/modified/removed.
                hard_assert(
                    target_change.added_documents.len()
                        + target_change.modified_documents.len()
                        + target_change.removed_documents.len()
                        <= 1,
                    "Limbo target changes carry at most a single document",
                );
                if !target_change.added_documents.is_empty() {
                    resolution.received_document = true;
                } else if !target_change.modified_documents.is_empty() {
                    hard_assert(
                        resolution.received_document,
                        "Received change for limbo target document without add",
                    );
                } else if !target_change.removed_documents.is_empty() {
                    hard_assert(
                        resolution.received_document,
                        "Received remove for limbo target document without add",
                    );
                    resolution.received_document = false;
                }
            }
        }
        self.emit_new_snaps_and_notify_local_store(changes, Some(&event))
            .await
    }

    async fn reject_listen_impl(&self, target_id: i32, error: StoreError) -> StoreResult<()> {
        let limbo_key = {
            let state = self.state.lock().unwrap();
            state
                .active_limbo_resolutions_by_target
                .get(&target_id)
                .map(|resolution| resolution.key.clone())
        };
        if let Some(limbo_key) = limbo_key {
            let requests = {
                let mut state = self.state.lock().unwrap();
                state.active_limbo_targets_by_key.remove(&limbo_key);
                state.active_limbo_resolutions_by_target.remove(&target_id);
                let mut requests = LimboTargetRequests::default();
                self.pump_enqueued_limbo_resolutions(&mut state, &mut requests);
                requests
            };
            self.apply_limbo_requests(requests).await?;
            // The backend will not serve this document; treat it as
            // deleted so the views can settle.
            let mut event = RemoteEvent::default();
            event.document_updates.insert(
                limbo_key.clone(),
                MaybeDocument::NoDocument(NoDocument::new(
                    limbo_key.clone(),
                    SnapshotVersion::min(),
                    false,
                )),
            );
            event.resolved_limbo_documents.insert(limbo_key);
            self.apply_remote_event_impl(event).await
        } else {
            self.local_store.release_target(target_id, false)?;
            let (errored, requests) = self.remove_and_cleanup_target(target_id, Some(&error));
            if let Some(listener) = self.listener() {
                for (query, error) in errored {
                    listener.on_watch_error(&query, error);
                }
            }
            self.apply_limbo_requests(requests).await
        }
    }

    async fn apply_successful_write_impl(&self, result: MutationBatchResult) -> StoreResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.local_store.acknowledge_batch(&result)?;
        {
            let mut state = self.state.lock().unwrap();
            // Write callbacks settle before the snapshots they caused.
            process_user_callback(&mut state, batch_id, None);
            trigger_pending_writes_callbacks(&mut state, batch_id);
        }
        self.emit_new_snaps_and_notify_local_store(changes, None)
            .await
    }

    async fn reject_failed_write_impl(&self, batch_id: i32, error: StoreError) -> StoreResult<()> {
        let changes = self.local_store.reject_batch(batch_id)?;
        {
            let mut state = self.state.lock().unwrap();
            // Write callbacks settle before the snapshots they caused.
            process_user_callback(&mut state, batch_id, Some(error));
            trigger_pending_writes_callbacks(&mut state, batch_id);
        }
        self.emit_new_snaps_and_notify_local_store(changes, None)
            .await
    }

    async fn handle_credential_change_impl(&self, user: User) -> StoreResult<()> {
        let user_changed = {
            let state = self.state.lock().unwrap();
            state.current_user != user
        };
        if !user_changed {
            return Ok(());
        }
        log::debug!("SyncEngine: user changed to {:?}", user.uid());
        let result = self.local_store.handle_user_change(&user)?;
        {
            let mut state = self.state.lock().unwrap();
            state.current_user = user;
            // Writes queued by the previous user can no longer settle
            // under this client.
            for (_, callbacks) in std::mem::take(&mut state.pending_writes_callbacks) {
                for callback in callbacks {
                    let _ = callback.send(Err(cancelled(
                        "pending writes callback cancelled by a user change",
                    )));
                }
            }
        }
        self.emit_new_snaps_and_notify_local_store(result.affected_documents, None)
            .await
    }

    /// The keys the backend has confirmed for a target. Limbo targets
    /// answer with their single key once any version of the document
    /// arrived; query targets answer from their views.
    fn remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        let state = self.state.lock().unwrap();
        if let Some(resolution) = state.active_limbo_resolutions_by_target.get(&target_id) {
            let mut keys = BTreeSet::new();
            if resolution.received_document {
                keys.insert(resolution.key.clone());
            }
            return keys;
        }
        let mut keys = BTreeSet::new();
        if let Some(queries) = state.queries_by_target.get(&target_id) {
            for query in queries {
                match state.query_views_by_query.get(&query.canonical_id()) {
                    Some(query_view) => {
                        keys.extend(query_view.view.synced_documents().iter().cloned())
                    }
                    None => fail("Missing view for an active query"),
                }
            }
        }
        keys
    }

    /// Recomputes every view against the changed documents, fans the
    /// resulting snapshots out and tells the local store which keys each
    /// view now references.
    async fn emit_new_snaps_and_notify_local_store(
        &self,
        changes: BTreeMap<DocumentKey, MaybeDocument>,
        remote_event: Option<&RemoteEvent>,
    ) -> StoreResult<()> {
        let mut snapshots = Vec::new();
        let mut view_changes = Vec::new();
        let mut requests = LimboTargetRequests::default();
        {
            let mut state = self.state.lock().unwrap();
            if state.query_views_by_query.is_empty() {
                return Ok(());
            }
            let mut limbo_updates = Vec::new();
            for query_view in state.query_views_by_query.values_mut() {
                let mut computed = query_view.view.compute_doc_changes(&changes, None);
                if computed.needs_refill {
                    // A limit query lost documents; only the cache knows
                    // what moved up into the result set.
                    let query_result = self
                        .local_store
                        .execute_query(query_view.view.query(), false)?;
                    let documents: BTreeMap<DocumentKey, MaybeDocument> = query_result
                        .documents
                        .into_iter()
                        .map(|(key, document)| (key, MaybeDocument::from(document)))
                        .collect();
                    computed = query_view
                        .view
                        .compute_doc_changes(&documents, Some(computed));
                }
                let target_change =
                    remote_event.and_then(|event| event.target_changes.get(&query_view.target_id));
                let view_change = query_view.view.apply_changes(computed, true, target_change);
                if !view_change.limbo_changes.is_empty() {
                    limbo_updates.push((query_view.target_id, view_change.limbo_changes));
                }
                if let Some(snapshot) = view_change.snapshot {
                    view_changes.push(LocalViewChanges::from_snapshot(
                        query_view.target_id,
                        &snapshot,
                    ));
                    snapshots.push(snapshot);
                }
            }
            for (target_id, limbo_changes) in limbo_updates {
                self.update_tracked_limbos(&mut state, limbo_changes, target_id, &mut requests);
            }
        }
        self.apply_limbo_requests(requests).await?;
        if let Some(listener) = self.listener() {
            listener.on_watch_change(snapshots);
        }
        self.local_store.notify_local_view_changes(view_changes)?;
        Ok(())
    }

    /// Drops every view of a target. With an error, the queries are
    /// reported to the caller for listener fan-out.
    fn remove_and_cleanup_target(
        &self,
        target_id: i32,
        error: Option<&StoreError>,
    ) -> (Vec<(Query, StoreError)>, LimboTargetRequests) {
        let mut state = self.state.lock().unwrap();
        let queries = match state.queries_by_target.remove(&target_id) {
            Some(queries) => queries,
            None => fail("Missing queries for an active target"),
        };
        let mut errored = Vec::new();
        for query in queries {
            state.query_views_by_query.remove(&query.canonical_id());
            if let Some(error) = error {
                errored.push((query, error.clone()));
            }
        }
        let mut requests = LimboTargetRequests::default();
        let orphaned = state.limbo_document_refs.remove_references_for_id(target_id);
        for key in orphaned {
            if !state.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(&mut state, &key, &mut requests);
            }
        }
        (errored, requests)
    }

    fn update_tracked_limbos(
        &self,
        state: &mut SyncEngineState,
        limbo_changes: Vec<LimboDocumentChange>,
        target_id: i32,
        requests: &mut LimboTargetRequests,
    ) {
        for change in limbo_changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    state
                        .limbo_document_refs
                        .add_reference(key.clone(), target_id);
                    self.track_limbo_change(state, key, requests);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("SyncEngine: document no longer in limbo: {:?}", key);
                    state.limbo_document_refs.remove_reference(&key, target_id);
                    if !state.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(state, &key, requests);
                    }
                }
            }
        }
    }

    fn track_limbo_change(
        &self,
        state: &mut SyncEngineState,
        key: DocumentKey,
        requests: &mut LimboTargetRequests,
    ) {
        if state.active_limbo_targets_by_key.contains_key(&key)
            || state.enqueued_limbo_resolutions.contains(&key)
        {
            return;
        }
        log::debug!("SyncEngine: new document in limbo: {:?}", key);
        state.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions(state, requests);
    }

    fn remove_limbo_target(
        &self,
        state: &mut SyncEngineState,
        key: &DocumentKey,
        requests: &mut LimboTargetRequests,
    ) {
        if let Some(position) = state
            .enqueued_limbo_resolutions
            .iter()
            .position(|queued| queued == key)
        {
            state.enqueued_limbo_resolutions.remove(position);
        }
        let target_id = match state.active_limbo_targets_by_key.remove(key) {
            Some(target_id) => target_id,
            // The document never got its listen slot.
            None => return,
        };
        state.active_limbo_resolutions_by_target.remove(&target_id);
        requests.unlistens.push(target_id);
        self.pump_enqueued_limbo_resolutions(state, requests);
    }

    /// Starts listens for queued limbo documents up to the concurrency
    /// bound. Limbo targets use an invalid sequence number so they are
    /// never persisted or tracked by garbage collection.
    fn pump_enqueued_limbo_resolutions(
        &self,
        state: &mut SyncEngineState,
        requests: &mut LimboTargetRequests,
    ) {
        while state.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let key = match state.enqueued_limbo_resolutions.pop_front() {
                Some(key) => key,
                None => break,
            };
            let target_id = state.limbo_target_id_generator.next();
            state.active_limbo_resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            state
                .active_limbo_targets_by_key
                .insert(key.clone(), target_id);
            requests.listens.push(TargetData::new(
                Query::at_path(key.path().clone()).to_target(),
                target_id,
                ListenSequence::INVALID,
                QueryPurpose::LimboResolution,
            ));
        }
    }

    /// Sends the limbo target changes collected while the state lock was
    /// held.
    async fn apply_limbo_requests(&self, requests: LimboTargetRequests) -> StoreResult<()> {
        for target_id in requests.unlistens {
            self.remote_store().unlisten(target_id).await?;
        }
        for target_data in requests.listens {
            self.remote_store().listen(target_data).await?;
        }
        Ok(())
    }
}

fn process_user_callback(state: &mut SyncEngineState, batch_id: i32, error: Option<StoreError>) {
    let user = state.current_user.clone();
    let callbacks = match state.mutation_callbacks.get_mut(&user) {
        Some(callbacks) => callbacks,
        // Batches restored from persistence carry no callback.
        None => return,
    };
    if !callbacks.contains_key(&batch_id) {
        return;
    }
    let first_pending = callbacks.keys().next().copied();
    hard_assert(
        first_pending == Some(batch_id),
        "Mutation callbacks processed out-of-order",
    );
    if let Some(ack) = callbacks.remove(&batch_id) {
        let _ = ack.send(match error {
            Some(error) => Err(error),
            None => Ok(()),
        });
    }
    if callbacks.is_empty() {
        state.mutation_callbacks.remove(&user);
    }
}

fn trigger_pending_writes_callbacks(state: &mut SyncEngineState, batch_id: i32) {
    if let Some(callbacks) = state.pending_writes_callbacks.remove(&batch_id) {
        for callback in callbacks {
            let _ = callback.send(Ok(()));
        }
    }
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, StoreResult<()>> {
        box_remote_store_future(self.apply_remote_event_impl(event))
    }

    fn reject_listen(
        &self,
        target_id: i32,
        error: StoreError,
    ) -> RemoteStoreFuture<'_, StoreResult<()>> {
        box_remote_store_future(self.reject_listen_impl(target_id, error))
    }

    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> RemoteStoreFuture<'_, StoreResult<()>> {
        box_remote_store_future(self.apply_successful_write_impl(result))
    }

    fn reject_failed_write(
        &self,
        batch_id: i32,
        error: StoreError,
    ) -> RemoteStoreFuture<'_, StoreResult<()>> {
        box_remote_store_future(self.reject_failed_write_impl(batch_id, error))
    }

    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.remote_keys_for_target(target_id)
    }

    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, StoreResult<()>> {
        box_remote_store_future(self.handle_credential_change_impl(user))
    }
}
