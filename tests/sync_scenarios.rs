#![cfg(not(target_arch = "wasm32"))]

//! Cross-component scenarios driven through the public client API against
//! an in-memory backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;

use syncstore::auth::EmptyCredentialsProvider;
use syncstore::core::view_snapshot::ChangeType;
use syncstore::error::unavailable;
use syncstore::local::QueryPurpose;
use syncstore::model::{
    Document, DocumentKey, DocumentState, FieldPath, FieldTransform, MaybeDocument, Mutation,
    MutationResult, ObjectValue, Precondition, ResourcePath, Timestamp, TransformOperation,
};
use syncstore::query::Query;
use syncstore::remote::connection::{
    BackendStream, InMemoryConnection, ListenRequest, WatchResponse, WriteRequest, WriteResponse,
};
use syncstore::remote::watch_change::{
    DocumentWatchChange, WatchChange, WatchTargetChange, WatchTargetChangeState,
};
use syncstore::value::Value;
use syncstore::{
    ListenOptions, SnapshotVersion, StoreResult, SyncClient, SyncClientConfig, ViewSnapshot,
};

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
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

fn increment_mutation(path: &str, field: &str, by: i64) -> Mutation {
    Mutation::Transform {
        key: key(path),
        field_transforms: vec![FieldTransform {
            field: FieldPath::from_dot_separated(field).unwrap(),
            transform: TransformOperation::Increment(Value::Integer(by)),
        }],
    }
}

fn synced_doc(path: &str, seconds: i64, data: serde_json::Value) -> WatchResponse {
    let document = Document::new(
        key(path),
        version(seconds),
        ObjectValue::from_json(data).unwrap(),
        DocumentState::Synced,
    );
    WatchResponse {
        change: WatchChange::Document(DocumentWatchChange {
            updated_target_ids: vec![],
            removed_target_ids: vec![],
            key: key(path),
            new_document: Some(MaybeDocument::from(document)),
        }),
        snapshot_version: SnapshotVersion::min(),
    }
}

fn synced_doc_in_target(
    path: &str,
    seconds: i64,
    data: serde_json::Value,
    target_id: i32,
) -> WatchResponse {
    let mut response = synced_doc(path, seconds, data);
    if let WatchChange::Document(change) = &mut response.change {
        change.updated_target_ids = vec![target_id];
    }
    response
}

fn doc_removed(path: &str, target_id: i32) -> WatchResponse {
    WatchResponse {
        change: WatchChange::Document(DocumentWatchChange {
            updated_target_ids: vec![],
            removed_target_ids: vec![target_id],
            key: key(path),
            new_document: None,
        }),
        snapshot_version: SnapshotVersion::min(),
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

fn no_change(seconds: i64) -> WatchResponse {
    WatchResponse {
        change: WatchChange::Target(WatchTargetChange::new(
            WatchTargetChangeState::NoChange,
            vec![],
        )),
        snapshot_version: version(seconds),
    }
}

async fn add_target(backend: &BackendStream<ListenRequest, WatchResponse>) -> (i32, QueryPurpose) {
    match backend.next_request().await {
        Some(ListenRequest::AddTarget(request)) => (request.target_id, request.purpose),
        other => panic!("expected AddTarget, got {other:?}"),
    }
}

async fn removed_target(backend: &BackendStream<ListenRequest, WatchResponse>) -> i32 {
    match backend.next_request().await {
        Some(ListenRequest::RemoveTarget(target_id)) => target_id,
        other => panic!("expected RemoveTarget, got {other:?}"),
    }
}

type Delivered = Arc<Mutex<Vec<ViewSnapshot>>>;

fn recording_callback() -> (impl Fn(StoreResult<ViewSnapshot>) + Send + Sync + 'static, Delivered) {
    let log: Delivered = Arc::default();
    let sink = Arc::clone(&log);
    (
        move |snapshot| sink.lock().unwrap().push(snapshot.expect("listen error")),
        log,
    )
}

async fn wait_until<F>(predicate: F)
where
    F: Fn() -> bool,
{
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn new_client(connection: &InMemoryConnection) -> Arc<SyncClient> {
    Arc::new(SyncClient::new(
        Arc::new(connection.clone()),
        Arc::new(EmptyCredentialsProvider),
        SyncClientConfig::default(),
    ))
}

/// The `count` field of the single document in each snapshot that has one.
fn counts(events: &[ViewSnapshot]) -> Vec<i64> {
    let field = FieldPath::from_dot_separated("count").unwrap();
    events
        .iter()
        .filter_map(|snapshot| match snapshot.documents.first()?.field(&field) {
            Some(Value::Integer(value)) => Some(*value),
            _ => None,
        })
        .collect()
}

/// A write made offline surfaces immediately from cache, and once the
/// backend acknowledges it and the watch catches up, only listeners that
/// asked for metadata changes see the pending-writes flag clear.
#[tokio::test(flavor = "multi_thread")]
async fn offline_write_acknowledgement_flips_metadata_only() {
    let connection = InMemoryConnection::new();
    let client = new_client(&connection);
    client.disable_network().await.unwrap();

    let (default_callback, default_events) = recording_callback();
    let (metadata_callback, metadata_events) = recording_callback();
    let _default_registration = client
        .listen(rooms_query(), ListenOptions::default(), default_callback)
        .await
        .unwrap();
    let _metadata_registration = client
        .listen(
            rooms_query(),
            ListenOptions {
                include_metadata_changes: true,
                ..ListenOptions::default()
            },
            metadata_callback,
        )
        .await
        .unwrap();

    // Offline, the empty cache is served right away.
    assert_eq!(default_events.lock().unwrap().len(), 1);
    assert!(default_events.lock().unwrap()[0].from_cache);

    let writer = Arc::clone(&client);
    let write = tokio::spawn(async move {
        writer
            .write(vec![set_mutation("rooms/eros", json!({ "name": "eros" }))])
            .await
    });

    let events = Arc::clone(&default_events);
    wait_until(move || events.lock().unwrap().len() == 2).await;
    {
        let events = default_events.lock().unwrap();
        let snapshot = &events[1];
        assert!(snapshot.from_cache);
        assert!(snapshot.has_pending_writes());
        assert_eq!(snapshot.documents.len(), 1);
    }

    client.enable_network().await.unwrap();

    let write_backend = connection.wait_for_write_stream(1).await;
    assert!(matches!(
        write_backend.next_request().await,
        Some(WriteRequest::Handshake)
    ));
    write_backend
        .respond(WriteResponse {
            stream_token: Bytes::from_static(b"token-1"),
            commit_version: SnapshotVersion::min(),
            write_results: vec![],
        })
        .await;
    assert!(matches!(
        write_backend.next_request().await,
        Some(WriteRequest::Mutations { .. })
    ));
    write_backend
        .respond(WriteResponse {
            stream_token: Bytes::from_static(b"token-2"),
            commit_version: version(7),
            write_results: vec![MutationResult {
                version: version(7),
                transform_results: None,
            }],
        })
        .await;
    write.await.unwrap().unwrap();

    // The watch confirms the committed document; the data is unchanged so
    // the only difference is metadata.
    let watch = connection.wait_for_listen_stream(1).await;
    let (target_id, _) = add_target(&watch).await;
    watch
        .respond(synced_doc_in_target(
            "rooms/eros",
            7,
            json!({ "name": "eros" }),
            target_id,
        ))
        .await;
    watch.respond(current(vec![target_id])).await;
    watch.respond(no_change(7)).await;

    let events = Arc::clone(&metadata_events);
    wait_until(move || {
        events
            .lock()
            .unwrap()
            .last()
            .map(|snapshot| !snapshot.from_cache && !snapshot.has_pending_writes())
            .unwrap_or(false)
    })
    .await;
    {
        let events = metadata_events.lock().unwrap();
        let flip = events.last().unwrap();
        assert!(flip
            .doc_changes
            .iter()
            .any(|change| change.change_type == ChangeType::Metadata));
    }
    // Without the option the flip is filtered out.
    assert_eq!(default_events.lock().unwrap().len(), 2);
}

/// A document the backend drops from a query target without deleting goes
/// into limbo; when the limbo listen comes back current without the
/// document, the client applies the deletion it implies.
#[tokio::test(flavor = "multi_thread")]
async fn limbo_resolution_deletes_the_unaccounted_document() {
    let connection = InMemoryConnection::new();
    let client = new_client(&connection);

    let (callback, delivered) = recording_callback();
    let _registration = client
        .listen(rooms_query(), ListenOptions::default(), callback)
        .await
        .unwrap();

    let watch = connection.wait_for_listen_stream(1).await;
    let (target_id, purpose) = add_target(&watch).await;
    assert_eq!(purpose, QueryPurpose::Listen);

    watch
        .respond(synced_doc_in_target(
            "rooms/eros",
            4,
            json!({ "name": "eros" }),
            target_id,
        ))
        .await;
    watch.respond(current(vec![target_id])).await;
    watch.respond(no_change(4)).await;

    let events = Arc::clone(&delivered);
    wait_until(move || {
        events
            .lock()
            .unwrap()
            .last()
            .map(|snapshot| !snapshot.from_cache)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(delivered.lock().unwrap().len(), 1);

    // The backend drops the document from the target without a delete.
    watch.respond(doc_removed("rooms/eros", target_id)).await;
    watch.respond(no_change(5)).await;

    // A single-document listen probes for its fate.
    let (limbo_id, limbo_purpose) = add_target(&watch).await;
    assert_eq!(limbo_purpose, QueryPurpose::LimboResolution);

    // Current without the document: it does not exist on the backend.
    watch.respond(current(vec![limbo_id])).await;
    watch.respond(no_change(6)).await;

    let events = Arc::clone(&delivered);
    wait_until(move || {
        events
            .lock()
            .unwrap()
            .last()
            .map(|snapshot| snapshot.documents.is_empty() && !snapshot.from_cache)
            .unwrap_or(false)
    })
    .await;
    {
        let events = delivered.lock().unwrap();
        let resolution = events.last().unwrap();
        assert_eq!(resolution.doc_changes.len(), 1);
        assert_eq!(resolution.doc_changes[0].change_type, ChangeType::Removed);
    }
    assert_eq!(removed_target(&watch).await, limbo_id);
}

/// An increment evaluates against the base value captured when it was
/// staged, so resending the batch after a stream failure cannot apply it
/// twice anywhere a listener can observe.
#[tokio::test(flavor = "multi_thread")]
async fn a_resent_increment_never_double_counts() {
    let connection = InMemoryConnection::new();
    let client = new_client(&connection);

    let (callback, delivered) = recording_callback();
    let _registration = client
        .listen(
            rooms_query(),
            ListenOptions {
                include_metadata_changes: true,
                ..ListenOptions::default()
            },
            callback,
        )
        .await
        .unwrap();

    let watch = connection.wait_for_listen_stream(1).await;
    let (target_id, _) = add_target(&watch).await;

    // Seed the counter and let it sync.
    let writer = Arc::clone(&client);
    let first_write = tokio::spawn(async move {
        writer
            .write(vec![set_mutation("rooms/eros", json!({ "count": 1 }))])
            .await
    });
    let write_backend = connection.wait_for_write_stream(1).await;
    assert!(matches!(
        write_backend.next_request().await,
        Some(WriteRequest::Handshake)
    ));
    write_backend
        .respond(WriteResponse {
            stream_token: Bytes::from_static(b"token-1"),
            commit_version: SnapshotVersion::min(),
            write_results: vec![],
        })
        .await;
    assert!(matches!(
        write_backend.next_request().await,
        Some(WriteRequest::Mutations { .. })
    ));
    write_backend
        .respond(WriteResponse {
            stream_token: Bytes::from_static(b"token-2"),
            commit_version: version(5),
            write_results: vec![MutationResult {
                version: version(5),
                transform_results: None,
            }],
        })
        .await;
    first_write.await.unwrap().unwrap();

    watch
        .respond(synced_doc_in_target(
            "rooms/eros",
            5,
            json!({ "count": 1 }),
            target_id,
        ))
        .await;
    watch.respond(current(vec![target_id])).await;
    watch.respond(no_change(5)).await;

    let events = Arc::clone(&delivered);
    wait_until(move || {
        events
            .lock()
            .unwrap()
            .last()
            .map(|snapshot| !snapshot.from_cache && !snapshot.has_pending_writes())
            .unwrap_or(false)
    })
    .await;

    // Stage the increment; the view shows base + 1 immediately.
    let writer = Arc::clone(&client);
    let second_write = tokio::spawn(async move {
        writer
            .write(vec![increment_mutation("rooms/eros", "count", 1)])
            .await
    });
    let events = Arc::clone(&delivered);
    wait_until(move || counts(&events.lock().unwrap()).last() == Some(&2)).await;

    // The stream dies after the batch went out, before any ack.
    assert!(matches!(
        write_backend.next_request().await,
        Some(WriteRequest::Mutations { .. })
    ));
    write_backend.fail(unavailable("stream reset")).await;

    // The reconnected stream resends the same batch; this time it is
    // acknowledged, with the server-computed result.
    let write_backend = connection.wait_for_write_stream(2).await;
    assert!(matches!(
        write_backend.next_request().await,
        Some(WriteRequest::Handshake)
    ));
    write_backend
        .respond(WriteResponse {
            stream_token: Bytes::from_static(b"token-3"),
            commit_version: SnapshotVersion::min(),
            write_results: vec![],
        })
        .await;
    match write_backend.next_request().await {
        Some(WriteRequest::Mutations { mutations, .. }) => {
            assert_eq!(mutations, vec![increment_mutation("rooms/eros", "count", 1)]);
        }
        other => panic!("expected resent Mutations, got {other:?}"),
    }
    write_backend
        .respond(WriteResponse {
            stream_token: Bytes::from_static(b"token-4"),
            commit_version: version(8),
            write_results: vec![MutationResult {
                version: version(8),
                transform_results: Some(vec![Value::Integer(2)]),
            }],
        })
        .await;
    second_write.await.unwrap().unwrap();

    watch
        .respond(synced_doc_in_target(
            "rooms/eros",
            8,
            json!({ "count": 2 }),
            target_id,
        ))
        .await;
    watch.respond(no_change(8)).await;

    let events = Arc::clone(&delivered);
    wait_until(move || {
        events
            .lock()
            .unwrap()
            .last()
            .map(|snapshot| !snapshot.has_pending_writes())
            .unwrap_or(false)
    })
    .await;

    let events = delivered.lock().unwrap();
    let observed = counts(&events);
    assert_eq!(observed.last(), Some(&2));
    assert!(
        observed.iter().all(|count| *count == 1 || *count == 2),
        "a listener observed a double-counted increment: {observed:?}"
    );
}
