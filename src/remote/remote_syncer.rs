use std::collections::BTreeSet;

use futures::FutureExt;

use crate::auth::User;
use crate::error::{StoreError, StoreResult};
use crate::model::{DocumentKey, MutationBatchResult};
use crate::remote::remote_event::RemoteEvent;

#[cfg(target_arch = "wasm32")]
pub type RemoteStoreFuture<'a, T> = futures::future::LocalBoxFuture<'a, T>;
#[cfg(not(target_arch = "wasm32"))]
pub type RemoteStoreFuture<'a, T> = futures::future::BoxFuture<'a, T>;

#[cfg(target_arch = "wasm32")]
pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + 'a,
{
    future.boxed_local()
}

#[cfg(not(target_arch = "wasm32"))]
pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// Bridge between the remote store and the sync engine.
///
/// The remote store drives these callbacks from stream events, always from
/// the worker queue. Implementations own the interpretation of remote state;
/// the remote store itself keeps no document data.
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies a remote event produced by the watch change aggregator.
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, StoreResult<()>>;

    /// Signals that the backend rejected a watch target.
    fn reject_listen(
        &self,
        target_id: i32,
        error: StoreError,
    ) -> RemoteStoreFuture<'_, StoreResult<()>>;

    /// Applies the acknowledgement for a committed mutation batch.
    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> RemoteStoreFuture<'_, StoreResult<()>>;

    /// Drops a mutation batch the backend rejected with a permanent error.
    fn reject_failed_write(
        &self,
        batch_id: i32,
        error: StoreError,
    ) -> RemoteStoreFuture<'_, StoreResult<()>>;

    /// Returns the document keys last known to be synced for a target.
    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey>;

    /// Notifies the syncer that the authenticated user changed. Runs while
    /// the streams are torn down, before the network comes back up.
    fn handle_credential_change(&self, _user: User) -> RemoteStoreFuture<'_, StoreResult<()>> {
        box_remote_store_future(async { Ok(()) })
    }
}
