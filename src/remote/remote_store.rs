use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_lock::Mutex;
use async_trait::async_trait;
use bytes::Bytes;

use crate::auth::{CredentialsProviderArc, User};
use crate::core::OnlineState;
use crate::error::{is_permanent_write_error, StoreError, StoreErrorCode, StoreResult};
use crate::local::{LocalStore, QueryPurpose, TargetData};
use crate::model::{
    DocumentKey, MutationBatch, MutationBatchResult, MutationResult, SnapshotVersion,
    BATCH_ID_UNKNOWN,
};
use crate::util::assert::{fail, hard_assert};
use crate::util::async_queue::{box_queue_future, AsyncQueue};

use super::connection::Connection;
use super::listen_stream::{WatchStream, WatchStreamDelegate};
use super::online_state_tracker::{OnlineStateCallback, OnlineStateTracker};
use super::remote_syncer::RemoteSyncer;
use super::watch_change::{WatchChange, WatchTargetChange, WatchTargetChangeState};
use super::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use super::write_stream::{WriteStream, WriteStreamDelegate};

/// Upper bound on unacknowledged batches on the write stream. More batches
/// only means more to resend after a stream failure.
const MAX_PENDING_WRITES: usize = 10;

/// Reasons the remote store keeps its streams down. The network may only be
/// used while this set is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    PersistenceFault,
    Shutdown,
}

struct RemoteStoreState {
    /// Built fresh for every watch stream connection so stale accounting
    /// cannot leak across reconnects.
    watch_aggregator: Option<WatchChangeAggregator>,
    /// Batches sent (or queued to send) but not yet acknowledged, oldest
    /// first. Responses acknowledge strictly in order.
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
}

/// Coordinates the watch and write streams against the sync engine and the
/// local store.
///
/// All methods run as operations on the shared worker queue; stream events
/// come back through delegates holding a weak reference so a dropped store
/// silently detaches from in-flight callbacks.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

impl RemoteStore {
    pub fn new(
        queue: AsyncQueue,
        local_store: Arc<LocalStore>,
        connection: Arc<dyn Connection>,
        credentials: CredentialsProviderArc,
        remote_syncer: Weak<dyn RemoteSyncer>,
        on_online_state: OnlineStateCallback,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RemoteStoreInner>| {
            let watch_stream = WatchStream::new(
                queue.clone(),
                Arc::clone(&connection),
                Arc::clone(&credentials),
                Arc::new(RemoteWatchDelegate {
                    inner: weak.clone(),
                }),
            );
            let write_stream = WriteStream::new(
                queue.clone(),
                connection,
                credentials,
                Arc::new(RemoteWriteDelegate {
                    inner: weak.clone(),
                }),
            );
            RemoteStoreInner {
                queue: queue.clone(),
                local_store,
                remote_syncer,
                online_state_tracker: Arc::new(OnlineStateTracker::new(queue, on_online_state)),
                watch_stream,
                write_stream,
                listen_targets: StdMutex::new(BTreeMap::new()),
                state: Mutex::new(RemoteStoreState {
                    watch_aggregator: None,
                    write_pipeline: VecDeque::new(),
                    offline_causes: BTreeSet::new(),
                }),
            }
        });
        RemoteStore { inner }
    }

    /// Re-enables the network after [`disable_network`](Self::disable_network)
    /// and brings streams up if there is work for them. Also the start
    /// entry point: the first call loads the persisted write stream token.
    pub async fn enable_network(&self) -> StoreResult<()> {
        self.inner.enable_network().await
    }

    /// Tears down both streams and parks the store offline until
    /// [`enable_network`](Self::enable_network). Listeners are told the
    /// client is offline so they serve cached data.
    pub async fn disable_network(&self) -> StoreResult<()> {
        self.inner.disable_network().await
    }

    /// Permanently shuts the store down.
    pub async fn shutdown(&self) -> StoreResult<()> {
        self.inner.shutdown().await
    }

    /// Starts listening to a target. No-op if the target is already active.
    pub async fn listen(&self, target_data: TargetData) -> StoreResult<()> {
        self.inner.listen(target_data).await
    }

    /// Stops listening to a target.
    pub async fn unlisten(&self, target_id: i32) -> StoreResult<()> {
        self.inner.unlisten(target_id).await
    }

    /// Pulls pending mutation batches from the local store into the write
    /// pipeline, up to the in-flight cap, and starts the write stream when
    /// it has work.
    pub async fn fill_write_pipeline(&self) -> StoreResult<()> {
        self.inner.fill_write_pipeline().await
    }

    /// Restarts both streams under the new identity after letting the
    /// syncer swap per-user state.
    pub async fn handle_credential_change(&self, user: User) -> StoreResult<()> {
        self.inner.handle_credential_change(user).await
    }
}

struct RemoteStoreInner {
    queue: AsyncQueue,
    local_store: Arc<LocalStore>,
    /// Held weakly: the sync engine owns the remote store, so a strong
    /// reference here would form a cycle.
    remote_syncer: Weak<dyn RemoteSyncer>,
    online_state_tracker: Arc<OnlineStateTracker>,
    watch_stream: WatchStream,
    write_stream: WriteStream,
    /// Active targets by id. Kept outside `state` because the aggregator's
    /// metadata provider reads it synchronously mid-aggregation.
    listen_targets: StdMutex<BTreeMap<i32, TargetData>>,
    state: Mutex<RemoteStoreState>,
}

impl RemoteStoreInner {
    /// A gone syncer means the client is tearing down; callers skip the
    /// callback rather than fail.
    fn syncer(&self) -> Option<Arc<dyn RemoteSyncer>> {
        self.remote_syncer.upgrade()
    }

    async fn can_use_network(&self) -> bool {
        self.state.lock().await.offline_causes.is_empty()
    }

    async fn enable_network(self: &Arc<Self>) -> StoreResult<()> {
        {
            let mut state = self.state.lock().await;
            state.offline_causes.remove(&OfflineCause::UserDisabled);
        }
        self.enable_network_internal().await
    }

    async fn enable_network_internal(self: &Arc<Self>) -> StoreResult<()> {
        if self.can_use_network().await {
            // The write stream resumes from wherever the last session left
            // the persisted token.
            self.write_stream
                .set_last_stream_token(self.local_store.get_last_stream_token());
            if self.should_start_watch_stream().await {
                self.start_watch_stream().await;
            } else {
                self.online_state_tracker.set(OnlineState::Unknown);
            }
            self.fill_write_pipeline().await?;
        }
        Ok(())
    }

    async fn disable_network(self: &Arc<Self>) -> StoreResult<()> {
        {
            let mut state = self.state.lock().await;
            state.offline_causes.insert(OfflineCause::UserDisabled);
        }
        self.disable_network_internal().await?;
        // Listeners fall back to cached data right away rather than waiting
        // out the connection heuristics.
        self.online_state_tracker.set(OnlineState::Offline);
        Ok(())
    }

    async fn disable_network_internal(&self) -> StoreResult<()> {
        self.watch_stream.stop().await?;
        self.write_stream.stop().await?;
        let mut state = self.state.lock().await;
        if !state.write_pipeline.is_empty() {
            log::debug!(
                "RemoteStore: stopping write stream with {} pending writes",
                state.write_pipeline.len()
            );
            // The batches stay safe in the local store and re-enter the
            // pipeline on the next fill.
            state.write_pipeline.clear();
        }
        state.watch_aggregator = None;
        Ok(())
    }

    async fn shutdown(self: &Arc<Self>) -> StoreResult<()> {
        log::debug!("RemoteStore: shutting down");
        {
            let mut state = self.state.lock().await;
            state.offline_causes.insert(OfflineCause::Shutdown);
        }
        self.disable_network_internal().await?;
        // Unknown rather than Offline: shutdown is not a statement about
        // connectivity.
        self.online_state_tracker.set(OnlineState::Unknown);
        Ok(())
    }

    async fn handle_credential_change(self: &Arc<Self>, user: User) -> StoreResult<()> {
        log::debug!("RemoteStore: credential change for {:?}", user.uid());
        let uses_network = self.can_use_network().await;
        // Tear the streams down so the next connect picks up a token for
        // the new identity, and let the syncer swap per-user state while
        // nothing is in flight.
        {
            let mut state = self.state.lock().await;
            state.offline_causes.insert(OfflineCause::CredentialChange);
        }
        self.disable_network_internal().await?;
        if uses_network {
            self.online_state_tracker.set(OnlineState::Unknown);
        }
        if let Some(syncer) = self.syncer() {
            syncer.handle_credential_change(user).await?;
        }
        {
            let mut state = self.state.lock().await;
            state.offline_causes.remove(&OfflineCause::CredentialChange);
        }
        self.enable_network_internal().await
    }

    /// Flips the store offline after a local persistence fault and probes
    /// the local store with backoff until reads recover. Errors other than
    /// `Unavailable` are not recoverable and propagate.
    async fn disable_network_until_recovery(
        self: &Arc<Self>,
        error: StoreError,
    ) -> StoreResult<()> {
        if error.code() != StoreErrorCode::Unavailable {
            return Err(error);
        }
        log::warn!("RemoteStore: local store unavailable, going offline: {error}");
        {
            let mut state = self.state.lock().await;
            state.offline_causes.insert(OfflineCause::PersistenceFault);
        }
        self.disable_network_internal().await?;
        self.online_state_tracker.set(OnlineState::Offline);

        let inner = Arc::downgrade(self);
        self.queue.enqueue_retryable(move || {
            let inner = inner.clone();
            box_queue_future(async move {
                let inner = match inner.upgrade() {
                    Some(inner) => inner,
                    None => return Ok(()),
                };
                log::debug!("RemoteStore: probing local store");
                let _ = inner.local_store.get_last_remote_snapshot_version();
                {
                    let mut state = inner.state.lock().await;
                    state.offline_causes.remove(&OfflineCause::PersistenceFault);
                }
                inner.enable_network_internal().await
            })
        });
        Ok(())
    }

    // Watch stream.

    async fn listen(self: &Arc<Self>, target_data: TargetData) -> StoreResult<()> {
        let target_id = target_data.target_id;
        {
            let mut targets = self.listen_targets.lock().unwrap();
            if targets.contains_key(&target_id) {
                return Ok(());
            }
            targets.insert(target_id, target_data.clone());
        }
        if self.should_start_watch_stream().await {
            self.start_watch_stream().await;
        } else if self.watch_stream.is_open() {
            self.send_watch_request(&target_data).await?;
        }
        Ok(())
    }

    async fn unlisten(self: &Arc<Self>, target_id: i32) -> StoreResult<()> {
        let targets_left = {
            let mut targets = self.listen_targets.lock().unwrap();
            targets.remove(&target_id);
            !targets.is_empty()
        };
        if self.watch_stream.is_open() {
            self.send_unwatch_request(target_id).await?;
        }
        if !targets_left {
            if self.watch_stream.is_open() {
                self.watch_stream.mark_idle();
            } else if self.can_use_network().await {
                // No stream, no heuristic: report the state as undecided.
                self.online_state_tracker.set(OnlineState::Unknown);
            }
        }
        Ok(())
    }

    async fn send_watch_request(&self, target_data: &TargetData) -> StoreResult<()> {
        {
            let mut state = self.state.lock().await;
            match state.watch_aggregator.as_mut() {
                Some(aggregator) => aggregator.record_pending_target_request(target_data.target_id),
                None => fail("Watch request without an active aggregator"),
            }
        }
        self.watch_stream.watch(target_data).await
    }

    async fn send_unwatch_request(&self, target_id: i32) -> StoreResult<()> {
        self.watch_stream.unwatch(target_id).await
    }

    async fn should_start_watch_stream(&self) -> bool {
        self.can_use_network().await
            && !self.watch_stream.is_started()
            && !self.listen_targets.lock().unwrap().is_empty()
    }

    async fn start_watch_stream(self: &Arc<Self>) {
        hard_assert(
            self.should_start_watch_stream().await,
            "start_watch_stream called when it should not run",
        );
        {
            let mut state = self.state.lock().await;
            let provider = Arc::new(RemoteStoreMetadataProvider {
                inner: Arc::downgrade(self),
            });
            state.watch_aggregator = Some(WatchChangeAggregator::new(provider));
        }
        self.watch_stream.start();
        self.online_state_tracker.handle_watch_stream_start();
    }

    async fn on_watch_stream_open(&self) -> StoreResult<()> {
        let targets: Vec<TargetData> = self
            .listen_targets
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for target_data in targets {
            self.send_watch_request(&target_data).await?;
        }
        Ok(())
    }

    async fn on_watch_stream_change(
        self: &Arc<Self>,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> StoreResult<()> {
        // Any message proves the connection healthy.
        self.online_state_tracker.set(OnlineState::Online);

        if let WatchChange::Target(target_change) = &change {
            if target_change.state == WatchTargetChangeState::Removed
                && target_change.cause.is_some()
            {
                let target_change = target_change.clone();
                return match self.handle_target_error(&target_change).await {
                    Ok(()) => Ok(()),
                    Err(error) => self.disable_network_until_recovery(error).await,
                };
            }
        }

        {
            let mut state = self.state.lock().await;
            match state.watch_aggregator.as_mut() {
                Some(aggregator) => aggregator.handle_watch_change(change),
                None => fail("Watch change without an active aggregator"),
            }
        }

        if !snapshot_version.is_min()
            && snapshot_version >= self.local_store.get_last_remote_snapshot_version()
        {
            // The snapshot is complete and not older than anything already
            // applied, so it can be surfaced.
            let event = {
                let mut state = self.state.lock().await;
                match state.watch_aggregator.as_mut() {
                    Some(aggregator) => aggregator.create_remote_event(snapshot_version),
                    None => fail("Watch snapshot without an active aggregator"),
                }
            };
            if let Err(error) = self.raise_watch_snapshot(snapshot_version, event).await {
                log::debug!("RemoteStore: failed to raise snapshot: {error}");
                return self.disable_network_until_recovery(error).await;
            }
        }
        Ok(())
    }

    async fn raise_watch_snapshot(
        self: &Arc<Self>,
        snapshot_version: SnapshotVersion,
        event: super::remote_event::RemoteEvent,
    ) -> StoreResult<()> {
        hard_assert(
            !snapshot_version.is_min(),
            "Watch snapshots must carry a version",
        );

        let mismatched: Vec<TargetData> = {
            let mut targets = self.listen_targets.lock().unwrap();

            // Keep resume tokens fresh in memory on every snapshot; the
            // local store persists them on its own schedule.
            for (target_id, change) in &event.target_changes {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target_data) = targets.get(target_id).cloned() {
                    targets.insert(
                        *target_id,
                        target_data.with_resume_token(change.resume_token.clone(), snapshot_version),
                    );
                }
            }

            // Targets the existence filter invalidated restart from scratch:
            // drop the resume token and re-listen so the backend replays the
            // full target contents.
            event
                .target_mismatches
                .iter()
                .filter_map(|target_id| {
                    // A missing entry means the target was unlistened while
                    // the mismatch was on the wire.
                    let target_data = targets.get(target_id)?.clone();
                    targets.insert(
                        *target_id,
                        target_data
                            .clone()
                            .with_resume_token(Bytes::new(), target_data.snapshot_version),
                    );
                    Some(TargetData::new(
                        target_data.target,
                        *target_id,
                        target_data.sequence_number,
                        QueryPurpose::ExistenceFilterMismatch,
                    ))
                })
                .collect()
        };

        for request_target in mismatched {
            self.send_unwatch_request(request_target.target_id).await?;
            self.send_watch_request(&request_target).await?;
        }

        match self.syncer() {
            Some(syncer) => syncer.apply_remote_event(event).await,
            None => Ok(()),
        }
    }

    async fn handle_target_error(&self, target_change: &WatchTargetChange) -> StoreResult<()> {
        let error = match &target_change.cause {
            Some(error) => error.clone(),
            None => fail("Handling target error without a cause"),
        };
        for target_id in &target_change.target_ids {
            // Errors for targets already removed can still arrive; ignore
            // them.
            let listened = self
                .listen_targets
                .lock()
                .unwrap()
                .contains_key(target_id);
            if !listened {
                continue;
            }
            if let Some(syncer) = self.syncer() {
                syncer.reject_listen(*target_id, error.clone()).await?;
            }
            self.listen_targets.lock().unwrap().remove(target_id);
            let mut state = self.state.lock().await;
            if let Some(aggregator) = state.watch_aggregator.as_mut() {
                aggregator.remove_target(*target_id);
            }
        }
        Ok(())
    }

    async fn on_watch_stream_close(self: &Arc<Self>, error: Option<StoreError>) -> StoreResult<()> {
        {
            let mut state = self.state.lock().await;
            state.watch_aggregator = None;
        }
        if self.should_start_watch_stream().await {
            if let Some(error) = &error {
                self.online_state_tracker.handle_watch_stream_failure(error);
            }
            // `start` waits out the backoff owed from the failure.
            self.start_watch_stream().await;
        } else {
            self.online_state_tracker.set(OnlineState::Unknown);
        }
        Ok(())
    }

    // Write stream.

    async fn should_start_write_stream(&self) -> bool {
        let pipeline_has_work = !self.state.lock().await.write_pipeline.is_empty();
        self.can_use_network().await && !self.write_stream.is_started() && pipeline_has_work
    }

    async fn start_write_stream(&self) {
        hard_assert(
            self.should_start_write_stream().await,
            "start_write_stream called when it should not run",
        );
        self.write_stream.start();
    }

    async fn fill_write_pipeline(self: &Arc<Self>) -> StoreResult<()> {
        loop {
            let (can_add, last_batch_id) = {
                let state = self.state.lock().await;
                (
                    state.offline_causes.is_empty()
                        && state.write_pipeline.len() < MAX_PENDING_WRITES,
                    state
                        .write_pipeline
                        .back()
                        .map(|batch| batch.batch_id)
                        .unwrap_or(BATCH_ID_UNKNOWN),
                )
            };
            if !can_add {
                break;
            }
            match self.local_store.next_mutation_batch(last_batch_id) {
                Some(batch) => self.add_to_write_pipeline(batch).await?,
                None => {
                    let drained = self.state.lock().await.write_pipeline.is_empty();
                    if drained {
                        self.write_stream.mark_idle();
                    }
                    break;
                }
            }
        }
        if self.should_start_write_stream().await {
            self.start_write_stream().await;
        }
        Ok(())
    }

    async fn add_to_write_pipeline(&self, batch: MutationBatch) -> StoreResult<()> {
        let mutations = batch.mutations.clone();
        {
            let mut state = self.state.lock().await;
            hard_assert(
                state.write_pipeline.len() < MAX_PENDING_WRITES,
                "Write pipeline full",
            );
            state.write_pipeline.push_back(batch);
        }
        if self.write_stream.is_open() && self.write_stream.handshake_complete() {
            self.write_stream.write_mutations(mutations).await?;
        }
        Ok(())
    }

    async fn on_write_stream_open(&self) -> StoreResult<()> {
        self.write_stream.write_handshake().await
    }

    async fn on_write_handshake_complete(&self) -> StoreResult<()> {
        // The token from the handshake response makes the session resumable
        // across client restarts.
        self.local_store
            .set_last_stream_token(self.write_stream.last_stream_token())?;

        // Send everything that queued up while the handshake was in flight.
        let batches: Vec<Vec<crate::model::Mutation>> = {
            let state = self.state.lock().await;
            state
                .write_pipeline
                .iter()
                .map(|batch| batch.mutations.clone())
                .collect()
        };
        for mutations in batches {
            self.write_stream.write_mutations(mutations).await?;
        }
        Ok(())
    }

    async fn on_mutation_result(
        self: &Arc<Self>,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> StoreResult<()> {
        let batch = {
            let mut state = self.state.lock().await;
            match state.write_pipeline.pop_front() {
                Some(batch) => batch,
                None => fail("Got result for empty write pipeline"),
            }
        };
        let result = MutationBatchResult::new(
            batch,
            commit_version,
            results,
            self.write_stream.last_stream_token(),
        );
        if let Some(syncer) = self.syncer() {
            if let Err(error) = syncer.apply_successful_write(result).await {
                self.disable_network_until_recovery(error).await?;
            }
        }
        // The acknowledged batch freed a pipeline slot.
        self.fill_write_pipeline().await
    }

    async fn on_write_stream_close(self: &Arc<Self>, error: Option<StoreError>) -> StoreResult<()> {
        if let Some(error) = error {
            let pipeline_empty = self.state.lock().await.write_pipeline.is_empty();
            if !pipeline_empty {
                if self.write_stream.handshake_complete() {
                    // The error concerns the oldest in-flight write.
                    self.handle_write_error(error).await?;
                } else {
                    self.handle_write_handshake_error(error)?;
                }
            }
        }
        // A rejected write may have refilled the pipeline.
        if self.should_start_write_stream().await {
            self.start_write_stream().await;
        }
        Ok(())
    }

    fn handle_write_handshake_error(&self, error: StoreError) -> StoreResult<()> {
        // A permanent handshake failure means the token itself is no longer
        // welcome: clear it everywhere and start over without one. Unlike
        // writes, `Aborted` stays permanent here.
        if error.code().is_permanent() {
            let token = self.write_stream.last_stream_token();
            log::debug!(
                "RemoteStore: error before completed handshake; resetting stream token {:?}: {}",
                token,
                error
            );
            self.write_stream.set_last_stream_token(Bytes::new());
            self.local_store.set_last_stream_token(Bytes::new())
        } else {
            // The token may still be fine; the connection will retry with
            // it after backoff.
            Ok(())
        }
    }

    async fn handle_write_error(self: &Arc<Self>, error: StoreError) -> StoreResult<()> {
        if !is_permanent_write_error(error.code()) {
            // Transient: the stream reconnects and resends the pipeline from
            // the start.
            return Ok(());
        }
        // The request itself was the problem; resending cannot help. Drop
        // it and reconnect without backoff, since the backend is healthy
        // enough to reject requests.
        let batch = {
            let mut state = self.state.lock().await;
            match state.write_pipeline.pop_front() {
                Some(batch) => batch,
                None => fail("Write error with empty write pipeline"),
            }
        };
        self.write_stream.inhibit_backoff();
        if let Some(syncer) = self.syncer() {
            if let Err(error) = syncer.reject_failed_write(batch.batch_id, error).await {
                self.disable_network_until_recovery(error).await?;
            }
        }
        self.fill_write_pipeline().await
    }
}

/// Feeds the aggregator from the remote store's own registry and the
/// syncer's synced-key bookkeeping.
struct RemoteStoreMetadataProvider {
    inner: Weak<RemoteStoreInner>,
}

impl TargetMetadataProvider for RemoteStoreMetadataProvider {
    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        match self.inner.upgrade().and_then(|inner| inner.syncer()) {
            Some(syncer) => syncer.get_remote_keys_for_target(target_id),
            None => BTreeSet::new(),
        }
    }

    fn get_target_data_for_target(&self, target_id: i32) -> Option<TargetData> {
        let inner = self.inner.upgrade()?;
        let targets = inner.listen_targets.lock().unwrap();
        targets.get(&target_id).cloned()
    }
}

struct RemoteWatchDelegate {
    inner: Weak<RemoteStoreInner>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl WatchStreamDelegate for RemoteWatchDelegate {
    async fn on_open(&self) -> StoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_watch_stream_open().await,
            None => Ok(()),
        }
    }

    async fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> StoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_watch_stream_change(change, snapshot_version).await,
            None => Ok(()),
        }
    }

    async fn on_close(&self, error: Option<StoreError>) -> StoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_watch_stream_close(error).await,
            None => Ok(()),
        }
    }
}

struct RemoteWriteDelegate {
    inner: Weak<RemoteStoreInner>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl WriteStreamDelegate for RemoteWriteDelegate {
    async fn on_open(&self) -> StoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_write_stream_open().await,
            None => Ok(()),
        }
    }

    async fn on_handshake_complete(&self) -> StoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_write_handshake_complete().await,
            None => Ok(()),
        }
    }

    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> StoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_mutation_result(commit_version, results).await,
            None => Ok(()),
        }
    }

    async fn on_close(&self, error: Option<StoreError>) -> StoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_write_stream_close(error).await,
            None => Ok(()),
        }
    }
}
