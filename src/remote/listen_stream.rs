use std::sync::Arc;

use async_trait::async_trait;

use crate::auth::{AuthToken, CredentialsProviderArc};
use crate::error::{StoreError, StoreResult};
use crate::local::TargetData;
use crate::model::SnapshotVersion;
use crate::util::async_queue::{AsyncQueue, TimerId};
use crate::util::backoff::{BackoffConfig, ExponentialBackoff};

use super::connection::{
    Connection, ListenRequest, WatchResponse, WatchTargetRequest, WireSender, WireStream,
};
use super::persistent_stream::{PersistentStream, StreamHooks};
use super::watch_change::WatchChange;

/// Receives watch stream events, already dispatched onto the worker queue.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait WatchStreamDelegate: Send + Sync + 'static {
    async fn on_open(&self) -> StoreResult<()>;

    async fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> StoreResult<()>;

    async fn on_close(&self, error: Option<StoreError>) -> StoreResult<()>;
}

struct WatchHooks {
    connection: Arc<dyn Connection>,
    backoff: Arc<ExponentialBackoff>,
    delegate: Arc<dyn WatchStreamDelegate>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamHooks for WatchHooks {
    type Request = ListenRequest;
    type Response = WatchResponse;

    fn label(&self) -> &'static str {
        "WatchStream"
    }

    async fn open_rpc(
        &self,
        token: Option<AuthToken>,
    ) -> StoreResult<WireStream<ListenRequest, WatchResponse>> {
        self.connection.open_listen_stream(token).await
    }

    async fn on_open(&self) -> StoreResult<()> {
        self.delegate.on_open().await
    }

    async fn on_message(&self, response: WatchResponse) -> StoreResult<()> {
        // Any inbound frame proves the backend is reachable.
        self.backoff.reset();
        self.delegate
            .on_watch_change(response.change, response.snapshot_version)
            .await
    }

    async fn tear_down(&self, _sender: &WireSender<ListenRequest>) {}

    async fn on_close(&self, error: Option<StoreError>) -> StoreResult<()> {
        self.delegate.on_close(error).await
    }
}

/// Stream of watch changes for the targets this client listens to.
///
/// Targets are added with [`watch`](WatchStream::watch) and dropped with
/// [`unwatch`](WatchStream::unwatch); the backend replies with interleaved
/// target and document changes on the same stream.
#[derive(Clone)]
pub struct WatchStream {
    machine: Arc<PersistentStream<WatchHooks>>,
}

impl WatchStream {
    pub fn new(
        queue: AsyncQueue,
        connection: Arc<dyn Connection>,
        credentials: CredentialsProviderArc,
        delegate: Arc<dyn WatchStreamDelegate>,
    ) -> Self {
        let backoff = Arc::new(ExponentialBackoff::new(
            queue.clone(),
            TimerId::ListenStreamConnectionBackoff,
            BackoffConfig::default(),
        ));
        let hooks = Arc::new(WatchHooks {
            connection,
            backoff: Arc::clone(&backoff),
            delegate,
        });
        WatchStream {
            machine: PersistentStream::new(
                queue,
                credentials,
                backoff,
                TimerId::ListenStreamIdle,
                hooks,
            ),
        }
    }

    pub fn start(&self) {
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

    /// Registers interest in a target, resuming from its resume token.
    pub async fn watch(&self, target_data: &TargetData) -> StoreResult<()> {
        self.machine
            .send_request(ListenRequest::AddTarget(WatchTargetRequest::from(
                target_data,
            )))
            .await
    }

    /// Tells the backend to stop sending changes for a target.
    pub async fn unwatch(&self, target_id: i32) -> StoreResult<()> {
        self.machine
            .send_request(ListenRequest::RemoveTarget(target_id))
            .await
    }
}
