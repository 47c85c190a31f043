//! Transport seam between the remote store and whatever carries its frames.
//!
//! The streams speak typed frames rather than encoded payloads; a concrete
//! [`Connection`] owns the mapping to its wire format. [`InMemoryConnection`]
//! is the loopback implementation used by tests and local tooling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::auth::AuthToken;
use crate::error::{unavailable, StoreError, StoreResult};
use crate::local::{QueryPurpose, TargetData};
use crate::model::{Mutation, MutationResult, SnapshotVersion};
use crate::platform::runtime;
use crate::query::Target;
use crate::util::assert::fail;

use super::watch_change::WatchChange;

/// A listen stream frame sent to the backend.
#[derive(Clone, Debug)]
pub enum ListenRequest {
    AddTarget(WatchTargetRequest),
    RemoveTarget(i32),
}

/// Everything the backend needs to establish or resume one target.
#[derive(Clone, Debug)]
pub struct WatchTargetRequest {
    pub target_id: i32,
    pub target: Target,
    /// Resume point from an earlier listen, or empty for a fresh start.
    pub resume_token: Bytes,
    /// Why the client runs this target; the backend uses it to tune
    /// existence filtering for limbo and mismatch re-listens.
    pub purpose: QueryPurpose,
}

impl From<&TargetData> for WatchTargetRequest {
    fn from(target_data: &TargetData) -> Self {
        WatchTargetRequest {
            target_id: target_data.target_id,
            target: target_data.target.clone(),
            resume_token: target_data.resume_token.clone(),
            purpose: target_data.purpose,
        }
    }
}

/// A frame received on the listen stream.
#[derive(Clone, Debug)]
pub struct WatchResponse {
    pub change: WatchChange,
    /// Version of the global snapshot the change belongs to, or the minimum
    /// version when the backend did not attach one.
    pub snapshot_version: SnapshotVersion,
}

/// A write stream frame sent to the backend.
#[derive(Clone, Debug)]
pub enum WriteRequest {
    /// First frame on every connection. Deliberately carries no stream
    /// token: the handshake response supplies the one later frames use.
    Handshake,
    Mutations {
        stream_token: Bytes,
        mutations: Vec<Mutation>,
    },
}

/// A frame received on the write stream: the handshake ack (empty results)
/// or the outcome of one mutation batch.
#[derive(Clone, Debug)]
pub struct WriteResponse {
    pub stream_token: Bytes,
    pub commit_version: SnapshotVersion,
    pub write_results: Vec<MutationResult>,
}

/// Sending half of an open stream, cheap to clone.
pub struct WireSender<Req> {
    tx: async_channel::Sender<Req>,
}

impl<Req> Clone for WireSender<Req> {
    fn clone(&self) -> Self {
        WireSender {
            tx: self.tx.clone(),
        }
    }
}

impl<Req> WireSender<Req> {
    pub async fn send(&self, request: Req) -> StoreResult<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| unavailable("wire stream closed"))
    }

    /// Signals the backend that no more requests follow.
    pub fn close(&self) {
        self.tx.close();
    }
}

/// Receiving half of an open stream.
pub struct WireReceiver<Resp> {
    rx: async_channel::Receiver<StoreResult<Resp>>,
}

impl<Resp> WireReceiver<Resp> {
    /// The next inbound frame. `None` marks a clean close; an `Err` frame
    /// carries the terminal stream error (nothing follows it).
    pub async fn recv(&self) -> Option<StoreResult<Resp>> {
        self.rx.recv().await.ok()
    }
}

/// One bidirectional stream as handed to the client side.
pub struct WireStream<Req, Resp> {
    sender: WireSender<Req>,
    receiver: WireReceiver<Resp>,
}

impl<Req, Resp> WireStream<Req, Resp> {
    pub fn new(
        tx: async_channel::Sender<Req>,
        rx: async_channel::Receiver<StoreResult<Resp>>,
    ) -> Self {
        WireStream {
            sender: WireSender { tx },
            receiver: WireReceiver { rx },
        }
    }

    pub fn split(self) -> (WireSender<Req>, WireReceiver<Resp>) {
        (self.sender, self.receiver)
    }
}

/// Factory for the two backend streams.
///
/// `open_*` must resolve promptly: implementations dial in the background
/// and surface connect failures through the stream's receiver, not the open
/// call. The token, when present, authenticates every frame on the stream.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Connection: Send + Sync {
    async fn open_listen_stream(
        &self,
        token: Option<AuthToken>,
    ) -> StoreResult<WireStream<ListenRequest, WatchResponse>>;

    async fn open_write_stream(
        &self,
        token: Option<AuthToken>,
    ) -> StoreResult<WireStream<WriteRequest, WriteResponse>>;
}

/// The backend half of one stream opened against [`InMemoryConnection`].
pub struct BackendStream<Req, Resp> {
    requests: async_channel::Receiver<Req>,
    responses: async_channel::Sender<StoreResult<Resp>>,
}

impl<Req, Resp> Clone for BackendStream<Req, Resp> {
    fn clone(&self) -> Self {
        BackendStream {
            requests: self.requests.clone(),
            responses: self.responses.clone(),
        }
    }
}

impl<Req, Resp> BackendStream<Req, Resp> {
    /// The next request the client sent, or `None` once the client closed
    /// its half.
    pub async fn next_request(&self) -> Option<Req> {
        self.requests.recv().await.ok()
    }

    /// Delivers a response frame to the client.
    pub async fn respond(&self, response: Resp) {
        let _ = self.responses.send(Ok(response)).await;
    }

    /// Delivers a terminal error and closes the stream.
    pub async fn fail(&self, error: StoreError) {
        let _ = self.responses.send(Err(error)).await;
        self.responses.close();
    }

    /// Closes the stream without an error.
    pub fn close(&self) {
        self.responses.close();
    }

    pub fn is_closed(&self) -> bool {
        self.responses.is_closed()
    }
}

#[derive(Default)]
struct InMemoryState {
    listen_streams: async_lock::Mutex<Vec<BackendStream<ListenRequest, WatchResponse>>>,
    write_streams: async_lock::Mutex<Vec<BackendStream<WriteRequest, WriteResponse>>>,
    fail_next_listen_open: AtomicBool,
    fail_next_write_open: AtomicBool,
}

/// Loopback [`Connection`]. Every opened stream gets a paired
/// [`BackendStream`] the test drives by hand.
#[derive(Clone, Default)]
pub struct InMemoryConnection {
    state: Arc<InMemoryState>,
}

impl InMemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `open_listen_stream` call fail.
    pub fn fail_next_listen_open(&self) {
        self.state.fail_next_listen_open.store(true, Ordering::SeqCst);
    }

    /// Makes the next `open_write_stream` call fail.
    pub fn fail_next_write_open(&self) {
        self.state.fail_next_write_open.store(true, Ordering::SeqCst);
    }

    pub async fn listen_stream_count(&self) -> usize {
        self.state.listen_streams.lock().await.len()
    }

    pub async fn write_stream_count(&self) -> usize {
        self.state.write_streams.lock().await.len()
    }

    /// Waits until at least `count` listen streams have been opened and
    /// returns the newest one.
    pub async fn wait_for_listen_stream(
        &self,
        count: usize,
    ) -> BackendStream<ListenRequest, WatchResponse> {
        for _ in 0..500 {
            {
                let streams = self.state.listen_streams.lock().await;
                if streams.len() >= count {
                    return streams[count - 1].clone();
                }
            }
            runtime::sleep(Duration::from_millis(10)).await;
        }
        fail("Timed out waiting for a listen stream to open")
    }

    /// Waits until at least `count` write streams have been opened and
    /// returns the newest one.
    pub async fn wait_for_write_stream(
        &self,
        count: usize,
    ) -> BackendStream<WriteRequest, WriteResponse> {
        for _ in 0..500 {
            {
                let streams = self.state.write_streams.lock().await;
                if streams.len() >= count {
                    return streams[count - 1].clone();
                }
            }
            runtime::sleep(Duration::from_millis(10)).await;
        }
        fail("Timed out waiting for a write stream to open")
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl Connection for InMemoryConnection {
    async fn open_listen_stream(
        &self,
        _token: Option<AuthToken>,
    ) -> StoreResult<WireStream<ListenRequest, WatchResponse>> {
        if self.state.fail_next_listen_open.swap(false, Ordering::SeqCst) {
            return Err(unavailable("simulated listen connect failure"));
        }
        let (request_tx, request_rx) = async_channel::unbounded();
        let (response_tx, response_rx) = async_channel::unbounded();
        self.state.listen_streams.lock().await.push(BackendStream {
            requests: request_rx,
            responses: response_tx,
        });
        Ok(WireStream::new(request_tx, response_rx))
    }

    async fn open_write_stream(
        &self,
        _token: Option<AuthToken>,
    ) -> StoreResult<WireStream<WriteRequest, WriteResponse>> {
        if self.state.fail_next_write_open.swap(false, Ordering::SeqCst) {
            return Err(unavailable("simulated write connect failure"));
        }
        let (request_tx, request_rx) = async_channel::unbounded();
        let (response_tx, response_rx) = async_channel::unbounded();
        self.state.write_streams.lock().await.push(BackendStream {
            requests: request_rx,
            responses: response_tx,
        });
        Ok(WireStream::new(request_tx, response_rx))
    }
}
