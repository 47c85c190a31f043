use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::auth::{AuthToken, CredentialsProviderArc};
use crate::error::{StoreError, StoreResult};
use crate::model::{Mutation, MutationResult, SnapshotVersion};
use crate::util::assert::hard_assert;
use crate::util::async_queue::{AsyncQueue, TimerId};
use crate::util::backoff::{BackoffConfig, ExponentialBackoff};

use super::connection::{Connection, WireSender, WireStream, WriteRequest, WriteResponse};
use super::persistent_stream::{PersistentStream, StreamHooks};

/// Receives write stream events, already dispatched onto the worker queue.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait WriteStreamDelegate: Send + Sync + 'static {
    async fn on_open(&self) -> StoreResult<()>;

    /// The handshake response arrived; mutations may be written now.
    async fn on_handshake_complete(&self) -> StoreResult<()>;

    /// The backend committed the oldest in-flight batch.
    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> StoreResult<()>;

    async fn on_close(&self, error: Option<StoreError>) -> StoreResult<()>;
}

#[derive(Default)]
struct WriteShared {
    handshake_complete: bool,
    last_stream_token: Bytes,
}

struct WriteHooks {
    connection: Arc<dyn Connection>,
    backoff: Arc<ExponentialBackoff>,
    delegate: Arc<dyn WriteStreamDelegate>,
    shared: Arc<Mutex<WriteShared>>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamHooks for WriteHooks {
    type Request = WriteRequest;
    type Response = WriteResponse;

    fn label(&self) -> &'static str {
        "WriteStream"
    }

    async fn open_rpc(
        &self,
        token: Option<AuthToken>,
    ) -> StoreResult<WireStream<WriteRequest, WriteResponse>> {
        self.connection.open_write_stream(token).await
    }

    async fn on_open(&self) -> StoreResult<()> {
        self.delegate.on_open().await
    }

    async fn on_message(&self, response: WriteResponse) -> StoreResult<()> {
        hard_assert(
            !response.stream_token.is_empty(),
            "Got a write response without a stream token",
        );
        let first_response = {
            let mut shared = self.shared.lock().unwrap();
            shared.last_stream_token = response.stream_token.clone();
            if shared.handshake_complete {
                false
            } else {
                shared.handshake_complete = true;
                true
            }
        };
        if first_response {
            hard_assert(
                response.write_results.is_empty(),
                "Got mutation results for handshake",
            );
            self.delegate.on_handshake_complete().await
        } else {
            // A committed write proves the stream healthy. The handshake
            // alone does not: the first write may be exactly what the
            // backend keeps rejecting.
            self.backoff.reset();
            self.delegate
                .on_mutation_result(response.commit_version, response.write_results)
                .await
        }
    }

    async fn tear_down(&self, sender: &WireSender<WriteRequest>) {
        let stream_token = {
            let shared = self.shared.lock().unwrap();
            if !shared.handshake_complete {
                return;
            }
            shared.last_stream_token.clone()
        };
        // An empty final write lets the backend release stream resources
        // without waiting for a timeout.
        let request = WriteRequest::Mutations {
            stream_token,
            mutations: Vec::new(),
        };
        if sender.send(request).await.is_err() {
            log::debug!("WriteStream: failed to send final write request");
        }
    }

    async fn on_close(&self, error: Option<StoreError>) -> StoreResult<()> {
        self.delegate.on_close(error).await
    }
}

/// Stream for committing mutation batches.
///
/// After connecting, the caller sends one handshake and waits for its
/// response before any mutations. Each subsequent response acknowledges
/// the oldest batch in flight and carries the stream token that makes the
/// next request resumable.
#[derive(Clone)]
pub struct WriteStream {
    machine: Arc<PersistentStream<WriteHooks>>,
    shared: Arc<Mutex<WriteShared>>,
}

impl WriteStream {
    pub fn new(
        queue: AsyncQueue,
        connection: Arc<dyn Connection>,
        credentials: CredentialsProviderArc,
        delegate: Arc<dyn WriteStreamDelegate>,
    ) -> Self {
        let backoff = Arc::new(ExponentialBackoff::new(
            queue.clone(),
            TimerId::WriteStreamConnectionBackoff,
            BackoffConfig::default(),
        ));
        let shared = Arc::new(Mutex::new(WriteShared::default()));
        let hooks = Arc::new(WriteHooks {
            connection,
            backoff: Arc::clone(&backoff),
            delegate,
            shared: Arc::clone(&shared),
        });
        WriteStream {
            machine: PersistentStream::new(
                queue,
                credentials,
                backoff,
                TimerId::WriteStreamIdle,
                hooks,
            ),
            shared,
        }
    }

    pub fn start(&self) {
        // Every connection negotiates its own handshake.
        self.shared.lock().unwrap().handshake_complete = false;
        self.machine.start();
    }

    pub async fn stop(&self) -> StoreResult<()> {
        self.machine.stop().await
    }

    pub fn is_started(&self) -> bool {
        self.machine.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.machine.is_open()
    }

    pub fn mark_idle(&self) {
        self.machine.mark_idle();
    }

    pub fn inhibit_backoff(&self) {
        self.machine.inhibit_backoff();
    }

    pub fn handshake_complete(&self) -> bool {
        self.shared.lock().unwrap().handshake_complete
    }

    pub fn last_stream_token(&self) -> Bytes {
        self.shared.lock().unwrap().last_stream_token.clone()
    }

    pub fn set_last_stream_token(&self, token: Bytes) {
        self.shared.lock().unwrap().last_stream_token = token;
    }

    /// Opens the session on a freshly connected stream. The handshake
    /// deliberately carries no stream token.
    pub async fn write_handshake(&self) -> StoreResult<()> {
        hard_assert(self.is_open(), "Writing handshake requires an opened stream");
        hard_assert(!self.handshake_complete(), "Handshake already completed");
        self.machine.send_request(WriteRequest::Handshake).await
    }

    /// Sends one mutation batch. Responses arrive in request order.
    pub async fn write_mutations(&self, mutations: Vec<Mutation>) -> StoreResult<()> {
        hard_assert(self.is_open(), "Writing mutations requires an opened stream");
        hard_assert(
            self.handshake_complete(),
            "Handshake must be complete before writing mutations",
        );
        let stream_token = self.last_stream_token();
        hard_assert(
            !stream_token.is_empty(),
            "Trying to write mutation without a token",
        );
        self.machine
            .send_request(WriteRequest::Mutations {
                stream_token,
                mutations,
            })
            .await
    }
}
