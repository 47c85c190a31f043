//! Fan-out from the sync engine to user snapshot callbacks.
//!
//! Many listeners may watch the same query; the event manager keeps one
//! sync-engine listen per distinct query and multiplexes its snapshots.
//! Each listener filters what it actually raises: metadata-only changes
//! are stripped unless asked for, and the initial event waits until the
//! snapshot is worth showing under the listener's options.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::core::sync_engine::{SyncEngine, SyncEngineListener};
use crate::core::types::OnlineState;
use crate::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::error::{StoreError, StoreResult};
use crate::query::Query;
use crate::util::assert::hard_assert;

/// Per-listener event filtering.
#[derive(Clone, Copy, Debug, Default)]
pub struct ListenOptions {
    /// Raise events that only change metadata: sync state and pending
    /// write flags. Off by default.
    pub include_metadata_changes: bool,
    /// Hold the initial event back until the backend has confirmed the
    /// result, unless the client is offline.
    pub wait_for_sync_when_online: bool,
}

pub type SnapshotCallback = Arc<dyn Fn(StoreResult<ViewSnapshot>) + Send + Sync>;

/// One registered callback and the raising state that decides which
/// snapshots it sees. Methods return the snapshot to deliver, if any;
/// the event manager invokes callbacks outside its lock.
struct QueryListener {
    id: u64,
    options: ListenOptions,
    callback: SnapshotCallback,
    raised_initial_event: bool,
    /// The last snapshot this listener saw, post-filtering.
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    fn new(id: u64, options: ListenOptions, callback: SnapshotCallback) -> Self {
        QueryListener {
            id,
            options,
            callback,
            raised_initial_event: false,
            snapshot: None,
            online_state: OnlineState::Unknown,
        }
    }

    fn on_view_snapshot(&mut self, mut snapshot: ViewSnapshot) -> Option<ViewSnapshot> {
        hard_assert(
            !snapshot.doc_changes.is_empty() || snapshot.sync_state_changed,
            "Got a new snapshot with no changes",
        );
        if !self.options.include_metadata_changes {
            let doc_changes = snapshot
                .doc_changes
                .iter()
                .filter(|change| change.change_type != ChangeType::Metadata)
                .cloned()
                .collect();
            snapshot = ViewSnapshot {
                doc_changes,
                excludes_metadata_changes: true,
                ..snapshot
            };
        }

        let deliver = if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                Some(self.raise_initial_event(&snapshot))
            } else {
                None
            }
        } else if self.should_raise_event(&snapshot) {
            Some(snapshot.clone())
        } else {
            None
        };
        self.snapshot = Some(snapshot);
        deliver
    }

    fn apply_online_state_change(&mut self, online_state: OnlineState) -> Option<ViewSnapshot> {
        self.online_state = online_state;
        if self.raised_initial_event {
            return None;
        }
        let snapshot = self.snapshot.clone()?;
        if self.should_raise_initial_event(&snapshot, online_state) {
            Some(self.raise_initial_event(&snapshot))
        } else {
            None
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, state: OnlineState) -> bool {
        // A synced snapshot is always worth an event.
        if !snapshot.from_cache {
            return true;
        }
        // Unknown counts as online; it settles one way or the other soon.
        let maybe_online = state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // Cached data is raised once it has content, or once the client is
        // confirmed offline and nothing better is coming.
        !snapshot.documents.is_empty() || state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        // Metadata-only changes were stripped above; whatever remains is
        // a real document change.
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .map(|previous| previous.has_pending_writes() != snapshot.has_pending_writes())
            .unwrap_or(false);
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    /// The first delivered snapshot presents every document as an add,
    /// regardless of how the view got here.
    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) -> ViewSnapshot {
        self.raised_initial_event = true;
        ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.documents.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
        )
    }
}

/// Listeners of one query plus the last snapshot the engine raised for
/// it, replayed to listeners that join later.
struct QueryListenersInfo {
    query: Query,
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<QueryListener>,
}

struct EventManagerState {
    /// Active queries keyed by canonical id.
    queries: BTreeMap<String, QueryListenersInfo>,
    online_state: OnlineState,
    next_listener_id: u64,
}

pub struct EventManager {
    sync_engine: Arc<SyncEngine>,
    state: Mutex<EventManagerState>,
}

impl EventManager {
    pub fn new(sync_engine: Arc<SyncEngine>) -> Arc<Self> {
        Arc::new(EventManager {
            sync_engine,
            state: Mutex::new(EventManagerState {
                queries: BTreeMap::new(),
                online_state: OnlineState::Unknown,
                next_listener_id: 0,
            }),
        })
    }

    /// Registers a snapshot callback for a query and returns its listener
    /// id. The first listener of a query starts the sync-engine listen;
    /// later ones attach to the running view and get an initial event from
    /// its last snapshot.
    pub async fn listen<F>(
        &self,
        query: Query,
        options: ListenOptions,
        callback: F,
    ) -> StoreResult<u64>
    where
        F: Fn(StoreResult<ViewSnapshot>) + Send + Sync + 'static,
    {
        let canonical_id = query.canonical_id();
        let first_listen = {
            let state = self.state.lock().unwrap();
            !state.queries.contains_key(&canonical_id)
        };
        let initial_snapshot = if first_listen {
            Some(self.sync_engine.listen(query.clone()).await?)
        } else {
            None
        };

        let (id, raise) = {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            let id = state.next_listener_id;
            state.next_listener_id += 1;
            let online_state = state.online_state;
            let info = state
                .queries
                .entry(canonical_id)
                .or_insert_with(|| QueryListenersInfo {
                    query,
                    view_snapshot: None,
                    listeners: Vec::new(),
                });
            if let Some(snapshot) = initial_snapshot {
                info.view_snapshot = Some(snapshot);
            }
            let mut listener = QueryListener::new(id, options, Arc::new(callback));
            listener.apply_online_state_change(online_state);
            let raise = info
                .view_snapshot
                .clone()
                .and_then(|snapshot| listener.on_view_snapshot(snapshot))
                .map(|snapshot| (Arc::clone(&listener.callback), snapshot));
            info.listeners.push(listener);
            (id, raise)
        };

        if let Some((callback, snapshot)) = raise {
            callback(Ok(snapshot));
        }
        Ok(id)
    }

    /// Detaches a listener. The last listener of a query stops the
    /// sync-engine listen.
    pub async fn unlisten(&self, listener_id: u64) -> StoreResult<()> {
        let last_listen_query = {
            let mut state = self.state.lock().unwrap();
            let mut emptied = None;
            for (canonical_id, info) in state.queries.iter_mut() {
                if let Some(position) = info
                    .listeners
                    .iter()
                    .position(|listener| listener.id == listener_id)
                {
                    info.listeners.remove(position);
                    if info.listeners.is_empty() {
                        emptied = Some(canonical_id.clone());
                    }
                    break;
                }
            }
            emptied.and_then(|canonical_id| {
                state
                    .queries
                    .remove(&canonical_id)
                    .map(|info| info.query)
            })
        };
        if let Some(query) = last_listen_query {
            self.sync_engine.unlisten(&query).await?;
        }
        Ok(())
    }
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        let mut raises: Vec<(SnapshotCallback, ViewSnapshot)> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            for snapshot in snapshots {
                let info = match state.queries.get_mut(&snapshot.query.canonical_id()) {
                    Some(info) => info,
                    None => continue,
                };
                for listener in &mut info.listeners {
                    if let Some(deliver) = listener.on_view_snapshot(snapshot.clone()) {
                        raises.push((Arc::clone(&listener.callback), deliver));
                    }
                }
                info.view_snapshot = Some(snapshot);
            }
        }
        for (callback, snapshot) in raises {
            callback(Ok(snapshot));
        }
    }

    fn on_watch_error(&self, query: &Query, error: StoreError) {
        let callbacks = {
            let mut state = self.state.lock().unwrap();
            match state.queries.remove(&query.canonical_id()) {
                Some(info) => info
                    .listeners
                    .into_iter()
                    .map(|listener| listener.callback)
                    .collect(),
                None => Vec::new(),
            }
        };
        for callback in callbacks {
            callback(Err(error.clone()));
        }
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let raises = {
            let mut state = self.state.lock().unwrap();
            state.online_state = online_state;
            let mut raises: Vec<(SnapshotCallback, ViewSnapshot)> = Vec::new();
            for info in state.queries.values_mut() {
                for listener in &mut info.listeners {
                    if let Some(deliver) = listener.apply_online_state_change(online_state) {
                        raises.push((Arc::clone(&listener.callback), deliver));
                    }
                }
            }
            raises
        };
        for (callback, snapshot) in raises {
            callback(Ok(snapshot));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex as StdMutex, Weak};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::auth::{EmptyCredentialsProvider, User};
    use crate::core::sync_engine::DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS;
    use crate::core::view_snapshot::DocumentViewChange;
    use crate::error::{permission_denied, StoreErrorCode};
    use crate::local::{LocalStore, MemoryPersistence, QueryPurpose};
    use crate::model::{
        Document, DocumentKey, DocumentSet, DocumentState, MaybeDocument, Mutation, ObjectValue,
        Precondition, ResourcePath, SnapshotVersion, Timestamp,
    };
    use crate::platform::runtime;
    use crate::remote::connection::{
        BackendStream, InMemoryConnection, ListenRequest, WatchResponse,
    };
    use crate::remote::remote_syncer::RemoteSyncer;
    use crate::remote::watch_change::{
        DocumentWatchChange, WatchChange, WatchTargetChange, WatchTargetChangeState,
    };
    use crate::remote::RemoteStore;
    use crate::util::async_queue::AsyncQueue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn rooms_query() -> Query {
        Query::at_path(ResourcePath::from_string("rooms").unwrap())
    }

    fn doc(path: &str, seconds: i64) -> Document {
        Document::new(
            key(path),
            version(seconds),
            ObjectValue::from_json(json!({ "name": path })).unwrap(),
            DocumentState::Synced,
        )
    }

    fn snapshot(
        query: &Query,
        documents: Vec<Document>,
        doc_changes: Vec<DocumentViewChange>,
        from_cache: bool,
        sync_state_changed: bool,
    ) -> ViewSnapshot {
        let mut document_set = DocumentSet::new(query.comparator());
        for document in documents {
            document_set.add(document);
        }
        ViewSnapshot {
            query: query.clone(),
            documents: document_set,
            old_documents: DocumentSet::new(query.comparator()),
            doc_changes,
            mutated_keys: Default::default(),
            from_cache,
            sync_state_changed,
            excludes_metadata_changes: false,
        }
    }

    fn added(path: &str, seconds: i64) -> DocumentViewChange {
        DocumentViewChange {
            doc: doc(path, seconds),
            change_type: ChangeType::Added,
        }
    }

    fn metadata(path: &str, seconds: i64) -> DocumentViewChange {
        DocumentViewChange {
            doc: doc(path, seconds),
            change_type: ChangeType::Metadata,
        }
    }

    fn listener(options: ListenOptions) -> QueryListener {
        QueryListener::new(0, options, Arc::new(|_| {}))
    }

    #[test]
    fn synced_snapshots_raise_the_initial_event() {
        let query = rooms_query();
        let mut listener = listener(ListenOptions::default());
        let snap = snapshot(
            &query,
            vec![doc("rooms/eros", 1)],
            vec![added("rooms/eros", 1)],
            false,
            true,
        );
        let raised = listener.on_view_snapshot(snap).unwrap();
        assert!(!raised.from_cache);
        // The initial event presents the full result as adds.
        assert_eq!(raised.doc_changes.len(), 1);
        assert_eq!(raised.doc_changes[0].change_type, ChangeType::Added);
        assert!(raised.old_documents.is_empty());
    }

    #[test]
    fn cached_snapshots_with_documents_raise_immediately() {
        let query = rooms_query();
        let mut listener = listener(ListenOptions::default());
        let snap = snapshot(
            &query,
            vec![doc("rooms/eros", 1)],
            vec![added("rooms/eros", 1)],
            true,
            true,
        );
        assert!(listener.on_view_snapshot(snap).is_some());
    }

    #[test]
    fn empty_cached_snapshots_wait_until_the_client_is_offline() {
        let query = rooms_query();
        let mut listener = listener(ListenOptions::default());
        let snap = snapshot(&query, vec![], vec![], true, true);
        // The backend may still deliver something better; hold the event.
        assert!(listener.on_view_snapshot(snap).is_none());
        assert!(listener
            .apply_online_state_change(OnlineState::Unknown)
            .is_none());

        let raised = listener
            .apply_online_state_change(OnlineState::Offline)
            .unwrap();
        assert!(raised.from_cache);
        assert!(raised.documents.is_empty());
    }

    #[test]
    fn wait_for_sync_holds_cached_snapshots_back() {
        let query = rooms_query();
        let mut listener = listener(ListenOptions {
            wait_for_sync_when_online: true,
            ..ListenOptions::default()
        });
        let cached = snapshot(
            &query,
            vec![doc("rooms/eros", 1)],
            vec![added("rooms/eros", 1)],
            true,
            true,
        );
        assert!(listener.on_view_snapshot(cached).is_none());

        let synced = snapshot(
            &query,
            vec![doc("rooms/eros", 1)],
            vec![],
            false,
            true,
        );
        let raised = listener.on_view_snapshot(synced).unwrap();
        assert!(!raised.from_cache);
    }

    #[test]
    fn wait_for_sync_still_raises_cached_snapshots_offline() {
        let query = rooms_query();
        let mut listener = listener(ListenOptions {
            wait_for_sync_when_online: true,
            ..ListenOptions::default()
        });
        listener.apply_online_state_change(OnlineState::Offline);
        let cached = snapshot(
            &query,
            vec![doc("rooms/eros", 1)],
            vec![added("rooms/eros", 1)],
            true,
            true,
        );
        assert!(listener.on_view_snapshot(cached).is_some());
    }

    #[test]
    fn metadata_only_changes_are_filtered_by_default() {
        let query = rooms_query();
        let mut listener = listener(ListenOptions::default());
        let initial = snapshot(
            &query,
            vec![doc("rooms/eros", 1)],
            vec![added("rooms/eros", 1)],
            false,
            true,
        );
        assert!(listener.on_view_snapshot(initial).is_some());

        let metadata_only = snapshot(
            &query,
            vec![doc("rooms/eros", 1)],
            vec![metadata("rooms/eros", 1)],
            false,
            false,
        );
        assert!(listener.on_view_snapshot(metadata_only).is_none());
    }

    #[test]
    fn metadata_changes_are_raised_when_asked_for() {
        let query = rooms_query();
        let mut listener = listener(ListenOptions {
            include_metadata_changes: true,
            ..ListenOptions::default()
        });
        let initial = snapshot(
            &query,
            vec![doc("rooms/eros", 1)],
            vec![added("rooms/eros", 1)],
            false,
            true,
        );
        assert!(listener.on_view_snapshot(initial).is_some());

        let metadata_only = snapshot(
            &query,
            vec![doc("rooms/eros", 1)],
            vec![metadata("rooms/eros", 1)],
            false,
            false,
        );
        let raised = listener.on_view_snapshot(metadata_only).unwrap();
        assert_eq!(raised.doc_changes[0].change_type, ChangeType::Metadata);
        assert!(!raised.excludes_metadata_changes);
    }

    #[test]
    fn sync_state_flips_alone_are_metadata_events() {
        let query = rooms_query();
        let mut listener = listener(ListenOptions::default());
        let initial = snapshot(
            &query,
            vec![doc("rooms/eros", 1)],
            vec![added("rooms/eros", 1)],
            true,
            true,
        );
        assert!(listener.on_view_snapshot(initial).is_some());

        // Going current without document changes is a metadata-level event.
        let synced = snapshot(&query, vec![doc("rooms/eros", 1)], vec![], false, true);
        assert!(listener.on_view_snapshot(synced).is_none());
    }

    // Full-stack coverage of the registry: listeners join and leave a
    // shared engine listen while watch traffic flows.

    type Delivered = Arc<StdMutex<Vec<StoreResult<ViewSnapshot>>>>;

    fn recording_callback() -> (
        impl Fn(StoreResult<ViewSnapshot>) + Send + Sync + 'static,
        Delivered,
    ) {
        let log: Delivered = Arc::default();
        let sink = Arc::clone(&log);
        (
            move |snapshot| sink.lock().unwrap().push(snapshot),
            log,
        )
    }

    struct Fixture {
        connection: InMemoryConnection,
        local_store: Arc<LocalStore>,
        event_manager: Arc<EventManager>,
        remote_store: RemoteStore,
    }

    async fn fixture() -> Fixture {
        let queue = AsyncQueue::new();
        let connection = InMemoryConnection::new();
        let persistence = MemoryPersistence::with_eager_garbage_collection();
        let local_store = Arc::new(LocalStore::new(persistence, &User::unauthenticated()));
        let engine = SyncEngine::new(
            Arc::clone(&local_store),
            User::unauthenticated(),
            DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
        );
        let event_manager = EventManager::new(Arc::clone(&engine));
        let listener_weak = Arc::downgrade(&event_manager) as Weak<dyn SyncEngineListener>;
        engine.subscribe(listener_weak);

        let online_engine = Arc::downgrade(&engine);
        let syncer = Arc::downgrade(&engine) as Weak<dyn RemoteSyncer>;
        let remote_store = RemoteStore::new(
            queue,
            Arc::clone(&local_store),
            Arc::new(connection.clone()),
            Arc::new(EmptyCredentialsProvider),
            syncer,
            Box::new(move |state| {
                if let Some(engine) = online_engine.upgrade() {
                    engine.apply_online_state_change(state);
                }
            }),
        );
        engine.attach_remote_store(remote_store.clone());
        remote_store.enable_network().await.unwrap();

        Fixture {
            connection,
            local_store,
            event_manager,
            remote_store,
        }
    }

    async fn wait_until<F>(predicate: F)
    where
        F: Fn() -> bool,
    {
        for _ in 0..500 {
            if predicate() {
                return;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn set_mutation(path: &str, data: serde_json::Value) -> Mutation {
        Mutation::Set {
            key: key(path),
            value: ObjectValue::from_json(data).unwrap(),
            precondition: Precondition::None,
        }
    }

    fn doc_change(path: &str, seconds: i64, target_id: i32) -> WatchResponse {
        WatchResponse {
            change: WatchChange::Document(DocumentWatchChange {
                updated_target_ids: vec![target_id],
                removed_target_ids: vec![],
                key: key(path),
                new_document: Some(MaybeDocument::from(doc(path, seconds))),
            }),
            snapshot_version: SnapshotVersion::min(),
        }
    }

    fn no_change(seconds: i64) -> WatchResponse {
        WatchResponse {
            change: WatchChange::Target(WatchTargetChange::new(
                WatchTargetChangeState::NoChange,
                vec![],
            )),
            snapshot_version: version(seconds),
        }
    }

    fn current(target_ids: Vec<i32>) -> WatchResponse {
        WatchResponse {
            change: WatchChange::Target(WatchTargetChange::new(
                WatchTargetChangeState::Current,
                target_ids,
            )),
            snapshot_version: SnapshotVersion::min(),
        }
    }

    async fn add_target_id(backend: &BackendStream<ListenRequest, WatchResponse>) -> i32 {
        match backend.next_request().await {
            Some(ListenRequest::AddTarget(request)) => {
                assert_eq!(request.purpose, QueryPurpose::Listen);
                request.target_id
            }
            other => panic!("expected AddTarget, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn the_first_listen_raises_the_cached_snapshot() {
        let fixture = fixture().await;
        fixture
            .local_store
            .local_write(vec![set_mutation("rooms/eros", json!({ "name": "eros" }))])
            .unwrap();

        let (callback, delivered) = recording_callback();
        fixture
            .event_manager
            .listen(rooms_query(), ListenOptions::default(), callback)
            .await
            .unwrap();

        let events = delivered.lock().unwrap();
        assert_eq!(events.len(), 1);
        let snapshot = events[0].as_ref().unwrap();
        assert!(snapshot.from_cache);
        assert_eq!(snapshot.documents.len(), 1);
    }

    #[tokio::test]
    async fn a_second_listener_attaches_without_a_new_watch_target() {
        let fixture = fixture().await;
        fixture
            .local_store
            .local_write(vec![set_mutation("rooms/eros", json!({ "name": "eros" }))])
            .unwrap();

        let (first, first_events) = recording_callback();
        let (second, second_events) = recording_callback();
        let manager = &fixture.event_manager;
        let first_id = manager
            .listen(rooms_query(), ListenOptions::default(), first)
            .await
            .unwrap();
        let second_id = manager
            .listen(rooms_query(), ListenOptions::default(), second)
            .await
            .unwrap();
        assert_ne!(first_id, second_id);

        // Both got their own initial event from the one shared view.
        assert_eq!(first_events.lock().unwrap().len(), 1);
        assert_eq!(second_events.lock().unwrap().len(), 1);

        let backend = fixture.connection.wait_for_listen_stream(1).await;
        let target_id = add_target_id(&backend).await;

        // Only the last detach stops the watch.
        manager.unlisten(first_id).await.unwrap();
        manager.unlisten(second_id).await.unwrap();
        match backend.next_request().await {
            Some(ListenRequest::RemoveTarget(removed)) => assert_eq!(removed, target_id),
            other => panic!("expected RemoveTarget, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn listeners_on_an_empty_cache_wait_for_the_backend() {
        let fixture = fixture().await;
        let (callback, delivered) = recording_callback();
        fixture
            .event_manager
            .listen(rooms_query(), ListenOptions::default(), callback)
            .await
            .unwrap();
        // Nothing cached and the backend may still answer: no event yet.
        assert!(delivered.lock().unwrap().is_empty());

        let backend = fixture.connection.wait_for_listen_stream(1).await;
        let target_id = add_target_id(&backend).await;
        backend.respond(doc_change("rooms/eros", 3, target_id)).await;
        backend.respond(current(vec![target_id])).await;
        backend.respond(no_change(3)).await;

        let events = Arc::clone(&delivered);
        wait_until(move || !events.lock().unwrap().is_empty()).await;
        let events = delivered.lock().unwrap();
        assert_eq!(events.len(), 1);
        let snapshot = events[0].as_ref().unwrap();
        assert!(!snapshot.from_cache);
        assert_eq!(snapshot.documents.len(), 1);
    }

    #[tokio::test]
    async fn going_offline_raises_the_held_back_initial_event() {
        let fixture = fixture().await;
        let (callback, delivered) = recording_callback();
        fixture
            .event_manager
            .listen(rooms_query(), ListenOptions::default(), callback)
            .await
            .unwrap();
        assert!(delivered.lock().unwrap().is_empty());

        fixture.remote_store.disable_network().await.unwrap();

        let events = delivered.lock().unwrap();
        assert_eq!(events.len(), 1);
        let snapshot = events[0].as_ref().unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.documents.is_empty());
    }

    #[tokio::test]
    async fn watch_errors_reach_every_listener_of_the_query() {
        let fixture = fixture().await;
        fixture
            .local_store
            .local_write(vec![set_mutation("rooms/eros", json!({ "name": "eros" }))])
            .unwrap();

        let (first, first_events) = recording_callback();
        let (second, second_events) = recording_callback();
        let manager = &fixture.event_manager;
        manager
            .listen(rooms_query(), ListenOptions::default(), first)
            .await
            .unwrap();
        manager
            .listen(rooms_query(), ListenOptions::default(), second)
            .await
            .unwrap();

        let backend = fixture.connection.wait_for_listen_stream(1).await;
        let target_id = add_target_id(&backend).await;
        let change = WatchTargetChange::new(WatchTargetChangeState::Removed, vec![target_id])
            .with_cause(permission_denied("no access"));
        backend
            .respond(WatchResponse {
                change: WatchChange::Target(change),
                snapshot_version: SnapshotVersion::min(),
            })
            .await;

        let events = Arc::clone(&first_events);
        wait_until(move || events.lock().unwrap().len() == 2).await;
        for delivered in [&first_events, &second_events] {
            let events = delivered.lock().unwrap();
            let error = events.last().unwrap().as_ref().unwrap_err();
            assert_eq!(error.code(), StoreErrorCode::PermissionDenied);
        }
    }

    #[tokio::test]
    async fn new_documents_fan_out_to_every_listener() {
        let fixture = fixture().await;
        fixture
            .local_store
            .local_write(vec![set_mutation("rooms/eros", json!({ "name": "eros" }))])
            .unwrap();

        let (first, first_events) = recording_callback();
        let (second, second_events) = recording_callback();
        let manager = &fixture.event_manager;
        manager
            .listen(rooms_query(), ListenOptions::default(), first)
            .await
            .unwrap();
        manager
            .listen(rooms_query(), ListenOptions::default(), second)
            .await
            .unwrap();

        let backend = fixture.connection.wait_for_listen_stream(1).await;
        let target_id = add_target_id(&backend).await;
        backend.respond(doc_change("rooms/aphrodite", 3, target_id)).await;
        backend.respond(doc_change("rooms/eros", 3, target_id)).await;
        backend.respond(current(vec![target_id])).await;
        backend.respond(no_change(3)).await;

        let events = Arc::clone(&first_events);
        wait_until(move || events.lock().unwrap().len() == 2).await;
        for delivered in [&first_events, &second_events] {
            let events = delivered.lock().unwrap();
            assert_eq!(events.len(), 2);
            let snapshot = events.last().unwrap().as_ref().unwrap();
            assert_eq!(snapshot.documents.len(), 2);
            assert!(!snapshot.from_cache);
        }
    }
}
