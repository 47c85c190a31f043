//! Top-level facade wiring the stores together.
//!
//! [`SyncClient`] owns the operation queue and every component behind it.
//! Construction wires local store, sync engine, event manager and remote
//! store, registers for credential changes and brings the network up; each
//! public operation then submits exactly one queue operation, so all state
//! below the facade is touched from one place.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::channel::oneshot;

use crate::auth::CredentialsProviderArc;
use crate::core::event_manager::{EventManager, ListenOptions};
use crate::core::sync_engine::{
    SyncEngine, SyncEngineListener, DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
};
use crate::core::view_snapshot::ViewSnapshot;
use crate::error::{cancelled, StoreResult};
use crate::local::{LocalStore, LruParams, LruScheduler, MemoryPersistence};
use crate::model::{DocumentKey, MaybeDocument, Mutation};
use crate::query::Query;
use crate::remote::remote_syncer::RemoteSyncer;
use crate::remote::{Connection, RemoteStore};
use crate::util::async_queue::{box_queue_future, AsyncQueue};

/// How cached documents are reclaimed.
#[derive(Clone, Copy, Debug)]
pub enum GarbageCollectionPolicy {
    /// Drop a cached document the moment nothing references it.
    Eager,
    /// Keep cached documents until the cache outgrows its threshold, then
    /// collect the least recently listened targets on a timer.
    Lru(LruParams),
}

#[derive(Clone, Copy, Debug)]
pub struct SyncClientConfig {
    pub garbage_collection: GarbageCollectionPolicy,
    pub max_concurrent_limbo_resolutions: usize,
}

impl Default for SyncClientConfig {
    fn default() -> Self {
        Self {
            garbage_collection: GarbageCollectionPolicy::Eager,
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
        }
    }
}

/// Handle to an attached snapshot listener.
///
/// Dropping the registration detaches the listener, as does calling
/// [`detach`](Self::detach) for an explicit spelling at the call site.
pub struct ListenerRegistration {
    queue: AsyncQueue,
    event_manager: Arc<EventManager>,
    id: Option<u64>,
}

impl ListenerRegistration {
    pub fn detach(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if let Some(id) = self.id.take() {
            let event_manager = Arc::clone(&self.event_manager);
            self.queue.enqueue_and_forget(move || {
                box_queue_future(async move { event_manager.unlisten(id).await })
            });
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.remove();
    }
}

pub struct SyncClient {
    queue: AsyncQueue,
    credentials: CredentialsProviderArc,
    local_store: Arc<LocalStore>,
    sync_engine: Arc<SyncEngine>,
    event_manager: Arc<EventManager>,
    remote_store: RemoteStore,
    lru_scheduler: Option<Arc<LruScheduler>>,
}

impl SyncClient {
    /// Builds and starts a client over the given transport and identity.
    ///
    /// The network comes up asynchronously; listeners attached before the
    /// first connection serve cached data meanwhile.
    pub fn new(
        connection: Arc<dyn Connection>,
        credentials: CredentialsProviderArc,
        config: SyncClientConfig,
    ) -> Self {
        let queue = AsyncQueue::new();
        let initial_user = credentials.current_user();

        let (persistence, collector) = match config.garbage_collection {
            GarbageCollectionPolicy::Eager => {
                (MemoryPersistence::with_eager_garbage_collection(), None)
            }
            GarbageCollectionPolicy::Lru(params) => {
                let (persistence, collector) =
                    MemoryPersistence::with_lru_garbage_collection(params);
                (persistence, Some(collector))
            }
        };
        let local_store = Arc::new(LocalStore::new(persistence, &initial_user));
        let sync_engine = SyncEngine::new(
            Arc::clone(&local_store),
            initial_user,
            config.max_concurrent_limbo_resolutions,
        );
        let event_manager = EventManager::new(Arc::clone(&sync_engine));
        let listener = Arc::downgrade(&event_manager) as Weak<dyn SyncEngineListener>;
        sync_engine.subscribe(listener);

        let online_engine = Arc::downgrade(&sync_engine);
        let syncer = Arc::downgrade(&sync_engine) as Weak<dyn RemoteSyncer>;
        let remote_store = RemoteStore::new(
            queue.clone(),
            Arc::clone(&local_store),
            connection,
            Arc::clone(&credentials),
            syncer,
            Box::new(move |state| {
                if let Some(engine) = online_engine.upgrade() {
                    engine.apply_online_state_change(state);
                }
            }),
        );
        sync_engine.attach_remote_store(remote_store.clone());

        let lru_scheduler = collector.map(|collector| {
            let scheduler = Arc::new(LruScheduler::new(Arc::new(queue.clone()), collector));
            scheduler.start(Arc::clone(&local_store));
            scheduler
        });

        // The provider echoes the current user when the listener registers;
        // construction already consumed it, so only real changes restart the
        // streams. Retryable, because the queue may be mid-recovery from a
        // persistence fault when the identity changes.
        let received_initial_user = AtomicBool::new(false);
        let change_queue = queue.clone();
        let change_store = remote_store.clone();
        credentials.set_change_listener(Box::new(move |user| {
            if !received_initial_user.swap(true, Ordering::SeqCst) {
                return;
            }
            let remote_store = change_store.clone();
            change_queue.enqueue_retryable(move || {
                let remote_store = remote_store.clone();
                let user = user.clone();
                box_queue_future(async move { remote_store.handle_credential_change(user).await })
            });
        }));

        let startup_store = remote_store.clone();
        queue.enqueue_and_forget(move || {
            box_queue_future(async move { startup_store.enable_network().await })
        });

        SyncClient {
            queue,
            credentials,
            local_store,
            sync_engine,
            event_manager,
            remote_store,
            lru_scheduler,
        }
    }

    /// The queue every client operation runs on. Embedders that need to
    /// sequence their own work against the client schedule it here.
    pub fn queue(&self) -> &AsyncQueue {
        &self.queue
    }

    /// Attaches a snapshot listener to a query.
    pub async fn listen<F>(
        &self,
        query: Query,
        options: ListenOptions,
        callback: F,
    ) -> StoreResult<ListenerRegistration>
    where
        F: Fn(StoreResult<ViewSnapshot>) + Send + Sync + 'static,
    {
        let event_manager = Arc::clone(&self.event_manager);
        let id = self
            .queue
            .enqueue(move || {
                box_queue_future(async move { event_manager.listen(query, options, callback).await })
            })
            .await?;
        Ok(ListenerRegistration {
            queue: self.queue.clone(),
            event_manager: Arc::clone(&self.event_manager),
            id: Some(id),
        })
    }

    /// Applies mutations locally and resolves once the backend acknowledges
    /// them. Listeners see the optimistic result as soon as the mutations
    /// are staged, long before this resolves.
    pub async fn write(&self, mutations: Vec<Mutation>) -> StoreResult<()> {
        let (sender, receiver) = oneshot::channel();
        let sync_engine = Arc::clone(&self.sync_engine);
        self.queue
            .enqueue(move || {
                box_queue_future(async move { sync_engine.write(mutations, sender).await })
            })
            .await?;
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(cancelled("client shut down before the write was acknowledged")),
        }
    }

    /// Resolves once every write pending at the time of the call has been
    /// acknowledged or rejected by the backend.
    pub async fn await_pending_writes(&self) -> StoreResult<()> {
        let (sender, receiver) = oneshot::channel();
        let sync_engine = Arc::clone(&self.sync_engine);
        self.queue
            .enqueue(move || {
                box_queue_future(async move {
                    sync_engine.register_pending_writes_callback(sender);
                    Ok(())
                })
            })
            .await?;
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(cancelled("client shut down while awaiting pending writes")),
        }
    }

    pub async fn enable_network(&self) -> StoreResult<()> {
        let remote_store = self.remote_store.clone();
        self.queue
            .enqueue(move || box_queue_future(async move { remote_store.enable_network().await }))
            .await
    }

    /// Parks the client offline: streams close and every listener gets a
    /// from-cache snapshot until the network is re-enabled.
    pub async fn disable_network(&self) -> StoreResult<()> {
        let remote_store = self.remote_store.clone();
        self.queue
            .enqueue(move || box_queue_future(async move { remote_store.disable_network().await }))
            .await
    }

    /// Reads a document straight from the local cache, local mutations
    /// applied. `None` when the cache knows nothing about the key.
    pub async fn read_document_from_cache(
        &self,
        key: DocumentKey,
    ) -> StoreResult<Option<MaybeDocument>> {
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue(move || box_queue_future(async move { Ok(local_store.read_document(&key)) }))
            .await
    }

    /// Permanently stops the client. Credential updates are ignored from
    /// here on, the streams shut down and the collection timer stops.
    pub async fn shutdown(&self) -> StoreResult<()> {
        self.credentials.remove_change_listener();
        if let Some(scheduler) = &self.lru_scheduler {
            scheduler.stop();
        }
        let remote_store = self.remote_store.clone();
        self.queue
            .enqueue(move || box_queue_future(async move { remote_store.shutdown().await }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::auth::{StaticCredentialsProvider, User};
    use crate::error::StoreErrorCode;
    use crate::model::{MutationResult, ObjectValue, Precondition, ResourcePath, SnapshotVersion};
    use crate::platform::runtime;
    use crate::query::Query;
    use crate::remote::connection::{InMemoryConnection, ListenRequest, WriteRequest, WriteResponse};
    use crate::util::async_queue::TimerId;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(crate::model::Timestamp::new(seconds, 0))
    }

    fn rooms_query() -> Query {
        Query::at_path(ResourcePath::from_string("rooms").unwrap())
    }

    fn set_mutation(path: &str, data: serde_json::Value) -> Mutation {
        Mutation::Set {
            key: key(path),
            value: ObjectValue::from_json(data).unwrap(),
            precondition: Precondition::None,
        }
    }

    type Delivered = Arc<StdMutex<Vec<StoreResult<ViewSnapshot>>>>;

    fn recording_callback() -> (
        impl Fn(StoreResult<ViewSnapshot>) + Send + Sync + 'static,
        Delivered,
    ) {
        let log: Delivered = Arc::default();
        let sink = Arc::clone(&log);
        (move |snapshot| sink.lock().unwrap().push(snapshot), log)
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

    async fn wait_for_cached(client: &SyncClient, path: &str) {
        let key = key(path);
        for _ in 0..500 {
            if client
                .read_document_from_cache(key.clone())
                .await
                .unwrap()
                .is_some()
            {
                return;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
        panic!("document never reached the cache");
    }

    fn client_over(connection: &InMemoryConnection) -> SyncClient {
        SyncClient::new(
            Arc::new(connection.clone()),
            Arc::new(StaticCredentialsProvider::new(User::unauthenticated())),
            SyncClientConfig::default(),
        )
    }

    async fn ack_next_write(connection: &InMemoryConnection, commit_seconds: i64) {
        let backend = connection.wait_for_write_stream(1).await;
        assert!(matches!(
            backend.next_request().await,
            Some(WriteRequest::Handshake)
        ));
        backend
            .respond(WriteResponse {
                stream_token: Bytes::from_static(b"token-1"),
                commit_version: SnapshotVersion::min(),
                write_results: vec![],
            })
            .await;
        match backend.next_request().await {
            Some(WriteRequest::Mutations { mutations, .. }) => assert_eq!(mutations.len(), 1),
            other => panic!("expected Mutations, got {other:?}"),
        }
        backend
            .respond(WriteResponse {
                stream_token: Bytes::from_static(b"token-2"),
                commit_version: version(commit_seconds),
                write_results: vec![MutationResult {
                    version: version(commit_seconds),
                    transform_results: None,
                }],
            })
            .await;
    }

    #[tokio::test]
    async fn a_write_resolves_once_the_backend_acknowledges_it() {
        let connection = InMemoryConnection::new();
        let client = client_over(&connection);

        let write = client.write(vec![set_mutation("rooms/eros", json!({ "name": "eros" }))]);
        let drive = ack_next_write(&connection, 7);
        let (result, ()) = tokio::join!(write, drive);
        result.unwrap();
    }

    #[tokio::test]
    async fn listeners_see_the_optimistic_write_before_the_ack() {
        let connection = InMemoryConnection::new();
        let client = client_over(&connection);

        let (callback, delivered) = recording_callback();
        let _registration = client
            .listen(rooms_query(), ListenOptions::default(), callback)
            .await
            .unwrap();

        let write = client.write(vec![set_mutation("rooms/eros", json!({ "name": "eros" }))]);
        let events = Arc::clone(&delivered);
        let drive = async {
            // The cached snapshot arrives without any backend involvement.
            wait_until(move || !events.lock().unwrap().is_empty()).await;
            {
                let events = delivered.lock().unwrap();
                let snapshot = events[0].as_ref().unwrap();
                assert!(snapshot.from_cache);
                assert_eq!(snapshot.documents.len(), 1);
            }
            ack_next_write(&connection, 7).await;
        };
        let (result, ()) = tokio::join!(write, drive);
        result.unwrap();
    }

    #[tokio::test]
    async fn detaching_the_registration_releases_the_watch_target() {
        let connection = InMemoryConnection::new();
        let client = client_over(&connection);

        let (callback, _delivered) = recording_callback();
        let registration = client
            .listen(rooms_query(), ListenOptions::default(), callback)
            .await
            .unwrap();

        let backend = connection.wait_for_listen_stream(1).await;
        let target_id = match backend.next_request().await {
            Some(ListenRequest::AddTarget(request)) => request.target_id,
            other => panic!("expected AddTarget, got {other:?}"),
        };

        registration.detach();
        match backend.next_request().await {
            Some(ListenRequest::RemoveTarget(removed)) => assert_eq!(removed, target_id),
            other => panic!("expected RemoveTarget, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn await_pending_writes_resolves_after_the_ack() {
        let connection = InMemoryConnection::new();
        let client = client_over(&connection);

        let write = client.write(vec![set_mutation("rooms/eros", json!({ "name": "eros" }))]);
        let pending = async {
            // Register once the write is staged so the batch is covered.
            wait_for_cached(&client, "rooms/eros").await;
            client.await_pending_writes().await
        };
        let drive = ack_next_write(&connection, 7);
        let (write_result, pending_result, ()) = tokio::join!(write, pending, drive);
        write_result.unwrap();
        pending_result.unwrap();
    }

    #[tokio::test]
    async fn reads_from_cache_see_staged_mutations() {
        let connection = InMemoryConnection::new();
        let client = client_over(&connection);

        let write = client.write(vec![set_mutation("rooms/eros", json!({ "name": "eros" }))]);
        let probe = async {
            wait_for_cached(&client, "rooms/eros").await;
            ack_next_write(&connection, 7).await;
        };
        let (result, ()) = tokio::join!(write, probe);
        result.unwrap();
    }

    #[tokio::test]
    async fn a_credential_change_restarts_the_streams() {
        let connection = InMemoryConnection::new();
        let credentials = Arc::new(StaticCredentialsProvider::new(User::unauthenticated()));
        let client = SyncClient::new(
            Arc::new(connection.clone()),
            Arc::clone(&credentials) as CredentialsProviderArc,
            SyncClientConfig::default(),
        );

        let (callback, _delivered) = recording_callback();
        let _registration = client
            .listen(rooms_query(), ListenOptions::default(), callback)
            .await
            .unwrap();
        connection.wait_for_listen_stream(1).await;

        credentials.set_user(User::new("alice"));

        // The listen restarts on a fresh stream under the new identity.
        let backend = connection.wait_for_listen_stream(2).await;
        assert!(matches!(
            backend.next_request().await,
            Some(ListenRequest::AddTarget(_))
        ));
    }

    #[tokio::test]
    async fn a_user_change_drops_the_other_users_pending_write_waiters() {
        let connection = InMemoryConnection::new();
        let credentials = Arc::new(StaticCredentialsProvider::new(User::unauthenticated()));
        let client = Arc::new(SyncClient::new(
            Arc::new(connection.clone()),
            Arc::clone(&credentials) as CredentialsProviderArc,
            SyncClientConfig::default(),
        ));

        // The ack never comes: the write stays pending across the switch.
        let writer = Arc::clone(&client);
        tokio::spawn(async move {
            let _ = writer
                .write(vec![set_mutation("rooms/eros", json!({ "name": "eros" }))])
                .await;
        });
        wait_for_cached(&client, "rooms/eros").await;

        let pending = client.await_pending_writes();
        let switch = async {
            runtime::sleep(Duration::from_millis(20)).await;
            credentials.set_user(User::new("alice"));
        };
        let (pending_result, ()) = tokio::join!(pending, switch);
        // The waiter is rejected; the write itself stays queued for the
        // original user and would resend if they signed back in.
        assert_eq!(
            pending_result.unwrap_err().code(),
            StoreErrorCode::Cancelled
        );
    }

    #[tokio::test]
    async fn the_lru_policy_schedules_collection_passes() {
        let connection = InMemoryConnection::new();
        let client = SyncClient::new(
            Arc::new(connection.clone()),
            Arc::new(StaticCredentialsProvider::new(User::unauthenticated())),
            SyncClientConfig {
                garbage_collection: GarbageCollectionPolicy::Lru(LruParams::default()),
                ..SyncClientConfig::default()
            },
        );
        assert!(client
            .queue()
            .contains_delayed_operation(TimerId::GarbageCollectionDelay));

        client.shutdown().await.unwrap();
        assert!(!client
            .queue()
            .contains_delayed_operation(TimerId::GarbageCollectionDelay));
    }
}
