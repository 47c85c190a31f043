use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;

use crate::core::view_snapshot::ChangeType;
use crate::local::{QueryPurpose, TargetData};
use crate::model::{DocumentKey, MaybeDocument, NoDocument, SnapshotVersion};
use crate::query::Target;
use crate::util::assert::{fail, hard_assert};

use super::remote_event::{RemoteEvent, TargetChange};
use super::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, WatchChange, WatchTargetChange,
    WatchTargetChangeState,
};

/// Target metadata the aggregator has to look up while folding changes.
///
/// Implemented by the remote store, which answers from its listen registry
/// and from the local cache's view of target membership.
pub trait TargetMetadataProvider: Send + Sync {
    /// The keys the backend had assigned to the target as of the last raised
    /// snapshot.
    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey>;

    /// Target data for an active target, or `None` once the target has been
    /// removed or errored.
    fn get_target_data_for_target(&self, target_id: i32) -> Option<TargetData>;
}

/// Folds a run of watch changes into [`RemoteEvent`]s.
///
/// One aggregator lives for the duration of a watch stream connection. Target
/// states survive across events; pending document updates, target mappings
/// and mismatches are consumed by [`Self::create_remote_event`].
pub struct WatchChangeAggregator {
    metadata_provider: Arc<dyn TargetMetadataProvider>,
    target_states: BTreeMap<i32, TargetState>,
    /// Document states received since the last raised snapshot.
    pending_document_updates: BTreeMap<DocumentKey, MaybeDocument>,
    /// Which targets each changed document was touched through.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<i32>>,
    /// Targets whose membership count disagreed with an existence filter.
    /// Their listens must be re-established without a resume token.
    pending_target_resets: BTreeSet<i32>,
}

impl WatchChangeAggregator {
    pub fn new(metadata_provider: Arc<dyn TargetMetadataProvider>) -> Self {
        WatchChangeAggregator {
            metadata_provider,
            target_states: BTreeMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeSet::new(),
        }
    }

    /// Dispatches a stream frame to the matching handler.
    pub fn handle_watch_change(&mut self, change: WatchChange) {
        match change {
            WatchChange::Document(doc_change) => self.handle_document_change(doc_change),
            WatchChange::Target(target_change) => self.handle_target_change(target_change),
            WatchChange::ExistenceFilter(filter) => self.handle_existence_filter(filter),
        }
    }

    /// Folds a document change into every target it names.
    pub fn handle_document_change(&mut self, change: DocumentWatchChange) {
        for &target_id in &change.updated_target_ids {
            match &change.new_document {
                Some(doc @ MaybeDocument::Document(_)) => {
                    self.add_document_to_target(target_id, doc.clone());
                }
                other => {
                    self.remove_document_from_target(target_id, &change.key, other.clone());
                }
            }
        }

        for &target_id in &change.removed_target_ids {
            self.remove_document_from_target(target_id, &change.key, change.new_document.clone());
        }
    }

    /// Folds a target state transition into the named targets, or into every
    /// active target when the change lists none.
    pub fn handle_target_change(&mut self, target_change: WatchTargetChange) {
        for target_id in self.targets_for_change(&target_change) {
            let active = self.is_active_target(target_id);
            let state = self.ensure_target_state(target_id);
            match target_change.state {
                WatchTargetChangeState::NoChange => {
                    if active {
                        state.update_resume_token(&target_change.resume_token);
                    }
                }
                WatchTargetChangeState::Added => {
                    // One fewer ack outstanding. A re-add (e.g. after a
                    // filter mismatch) starts from a clean slate.
                    state.record_target_response();
                    if !state.is_pending() {
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&target_change.resume_token);
                }
                WatchTargetChangeState::Removed => {
                    state.record_target_response();
                    let pending = state.is_pending();
                    if !pending {
                        self.remove_target(target_id);
                    }
                    debug_assert!(
                        target_change.cause.is_none(),
                        "errored targets are stripped before aggregation"
                    );
                }
                WatchTargetChangeState::Current => {
                    if active {
                        state.mark_current();
                        state.update_resume_token(&target_change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    if active {
                        // The token on a reset belongs to the discarded
                        // state, not the fresh one.
                        self.reset_target(target_id);
                    }
                }
            }
        }
    }

    /// Compares the backend's document count against the local view and, on
    /// mismatch, clears the target's membership and schedules a re-listen.
    ///
    /// A mismatched single-document target is resolved directly: a count of
    /// zero means the document is gone, so a tombstone is synthesized.
    pub fn handle_existence_filter(&mut self, filter: ExistenceFilterChange) {
        let target_id = filter.target_id;
        let expected_count = filter.count;

        let target_data = match self.target_data_for_active_target(target_id) {
            Some(data) => data,
            None => return,
        };
        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // Without the synthesized delete another query could keep
                // surfacing this document until its limbo state resolves.
                let key = document_target_key(&target_data.target);
                let tombstone = NoDocument::new(key.clone(), SnapshotVersion::min(), false);
                self.remove_document_from_target(target_id, &key, Some(tombstone.into()));
            } else {
                hard_assert(
                    expected_count == 1,
                    format!("Single document existence filter with count: {expected_count}"),
                );
            }
        } else {
            let current_size = self.current_document_count_for_target(target_id);
            if current_size != expected_count {
                self.reset_target(target_id);
                self.pending_target_resets.insert(target_id);
            }
        }
    }

    /// Converts the accumulated state into an event at the given snapshot
    /// version and clears everything the event consumed. Target states stay;
    /// they keep accumulating for the next event.
    pub fn create_remote_event(&mut self, snapshot_version: SnapshotVersion) -> RemoteEvent {
        let mut target_changes: BTreeMap<i32, TargetChange> = BTreeMap::new();

        let target_ids: Vec<i32> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let target_data = match self.target_data_for_active_target(target_id) {
                Some(data) => data,
                None => continue,
            };

            let current = self
                .target_states
                .get(&target_id)
                .map(|state| state.current)
                .unwrap_or(false);
            if current && target_data.target.is_document_target() {
                // A current single-document target without a matching update
                // means the document does not exist; synthesize the delete so
                // the cache and any limbo bookkeeping converge.
                let key = document_target_key(&target_data.target);
                if !self.pending_document_updates.contains_key(&key)
                    && !self.target_contains_document(target_id, &key)
                {
                    let tombstone = NoDocument::new(key.clone(), snapshot_version, false);
                    self.remove_document_from_target(target_id, &key, Some(tombstone.into()));
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        // A document tracked exclusively through limbo-resolution targets has
        // had its limbo state settled by this snapshot.
        let mut resolved_limbo_documents: BTreeSet<DocumentKey> = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let mut only_limbo_targets = true;
            for &target_id in targets {
                if let Some(target_data) = self.target_data_for_active_target(target_id) {
                    if target_data.purpose != QueryPurpose::LimboResolution {
                        only_limbo_targets = false;
                        break;
                    }
                }
            }
            if only_limbo_targets {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates: std::mem::take(&mut self.pending_document_updates),
            resolved_limbo_documents,
        }
    }

    /// Counts one more ack the aggregator must see before it treats the
    /// target as in sync with the backend.
    pub fn record_pending_target_request(&mut self, target_id: i32) {
        self.ensure_target_state(target_id).record_pending_target_request();
    }

    /// Drops all aggregation state for a target.
    pub fn remove_target(&mut self, target_id: i32) {
        self.target_states.remove(&target_id);
    }

    fn add_document_to_target(&mut self, target_id: i32, document: MaybeDocument) {
        if !self.is_active_target(target_id) {
            return;
        }

        let key = document.key().clone();
        let change_type = if self.target_contains_document(target_id, &key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key.clone(), document);
        self.ensure_document_target_mapping(&key).insert(target_id);
    }

    fn remove_document_from_target(
        &mut self,
        target_id: i32,
        key: &DocumentKey,
        updated_document: Option<MaybeDocument>,
    ) {
        if !self.is_active_target(target_id) {
            return;
        }

        let contains = self.target_contains_document(target_id, key);
        let state = self.ensure_target_state(target_id);
        if contains {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // The document entered and left the target between snapshots.
            state.remove_document_change(key);
        }

        self.ensure_document_target_mapping(key).remove(&target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    /// The target ids a change applies to: the ones it lists, or every
    /// active target when it lists none.
    fn targets_for_change(&self, target_change: &WatchTargetChange) -> Vec<i32> {
        if !target_change.target_ids.is_empty() {
            return target_change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|&target_id| self.is_active_target(target_id))
            .collect()
    }

    /// Membership count including changes accumulated since the last
    /// snapshot.
    fn current_document_count_for_target(&mut self, target_id: i32) -> i32 {
        let change = self.ensure_target_state(target_id).to_target_change();
        let remote_keys = self.metadata_provider.get_remote_keys_for_target(target_id);
        (remote_keys.len() + change.added_documents.len() - change.removed_documents.len()) as i32
    }

    fn ensure_target_state(&mut self, target_id: i32) -> &mut TargetState {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new)
    }

    fn ensure_document_target_mapping(&mut self, key: &DocumentKey) -> &mut BTreeSet<i32> {
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
    }

    /// Whether the target is still listened to and has no unacked target
    /// requests in flight.
    fn is_active_target(&self, target_id: i32) -> bool {
        let active = self.target_data_for_active_target(target_id).is_some();
        if !active {
            log::debug!("WatchChangeAggregator: detected inactive target {target_id}");
        }
        active
    }

    fn target_data_for_active_target(&self, target_id: i32) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => self.metadata_provider.get_target_data_for_target(target_id),
        }
    }

    /// Resets the target to its initial state and synthesizes removes for
    /// every document currently mapped to it. The backend re-adds whatever
    /// still matches before the next global snapshot.
    fn reset_target(&mut self, target_id: i32) {
        debug_assert!(
            !self
                .target_states
                .get(&target_id)
                .map(|state| state.is_pending())
                .unwrap_or(false),
            "resetting a target with pending acks"
        );
        self.target_states.insert(target_id, TargetState::new());

        let existing_keys = self.metadata_provider.get_remote_keys_for_target(target_id);
        for key in existing_keys {
            self.remove_document_from_target(target_id, &key, None);
        }
    }

    fn target_contains_document(&self, target_id: i32, key: &DocumentKey) -> bool {
        self.metadata_provider
            .get_remote_keys_for_target(target_id)
            .contains(key)
    }
}

fn document_target_key(target: &Target) -> DocumentKey {
    match DocumentKey::from_path(target.path.clone()) {
        Ok(key) => key,
        Err(_) => fail("Document target with a non-document path"),
    }
}

/// Per-target aggregation state.
struct TargetState {
    /// Outstanding adds or removes the backend has not acked. Only targets
    /// with no pending responses are treated as active.
    pending_responses: i32,
    /// Net document changes against the last raised snapshot.
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Bytes,
    current: bool,
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        TargetState {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Bytes::new(),
            current: false,
            // Newly tracked targets always surface in the next event.
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    /// Applies a resume token; empty tokens are discarded.
    fn update_resume_token(&mut self, resume_token: &Bytes) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.clone();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut added_documents = BTreeSet::new();
        let mut modified_documents = BTreeSet::new();
        let mut removed_documents = BTreeSet::new();
        for (key, change_type) in &self.document_changes {
            match change_type {
                ChangeType::Added => added_documents.insert(key.clone()),
                ChangeType::Modified => modified_documents.insert(key.clone()),
                ChangeType::Removed => removed_documents.insert(key.clone()),
                ChangeType::Metadata => fail("Metadata changes never reach the aggregator"),
            };
        }
        TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            added_documents,
            modified_documents,
            removed_documents,
        }
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
        hard_assert(
            self.pending_responses >= 0,
            "Got more target acks than outstanding requests",
        );
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::local::ListenSequence;
    use crate::model::{Document, DocumentState, ObjectValue, ResourcePath, Timestamp};
    use crate::query::Query;

    #[derive(Default)]
    struct TestMetadataProvider {
        targets: Mutex<BTreeMap<i32, TargetData>>,
        remote_keys: Mutex<BTreeMap<i32, BTreeSet<DocumentKey>>>,
    }

    impl TestMetadataProvider {
        fn set_target(&self, target_data: TargetData) {
            self.targets
                .lock()
                .unwrap()
                .insert(target_data.target_id, target_data);
        }

        fn set_remote_keys(&self, target_id: i32, keys: BTreeSet<DocumentKey>) {
            self.remote_keys.lock().unwrap().insert(target_id, keys);
        }
    }

    impl TargetMetadataProvider for TestMetadataProvider {
        fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
            self.remote_keys
                .lock()
                .unwrap()
                .get(&target_id)
                .cloned()
                .unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: i32) -> Option<TargetData> {
            self.targets.lock().unwrap().get(&target_id).cloned()
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str, seconds: i64) -> MaybeDocument {
        Document::new(
            key(path),
            version(seconds),
            ObjectValue::from_json(json!({"v": seconds})).unwrap(),
            DocumentState::Synced,
        )
        .into()
    }

    fn query_target(target_id: i32) -> TargetData {
        let target = Query::at_path(ResourcePath::from_string("rooms").unwrap()).to_target();
        TargetData::new(target, target_id, ListenSequence::INVALID, QueryPurpose::Listen)
    }

    fn doc_target(target_id: i32, path: &str, purpose: QueryPurpose) -> TargetData {
        TargetData::new(
            Target::for_document(&key(path)),
            target_id,
            ListenSequence::INVALID,
            purpose,
        )
    }

    fn aggregator(provider: &Arc<TestMetadataProvider>) -> WatchChangeAggregator {
        WatchChangeAggregator::new(Arc::clone(provider) as Arc<dyn TargetMetadataProvider>)
    }

    #[test]
    fn document_update_flows_into_event() {
        let provider = Arc::new(TestMetadataProvider::default());
        provider.set_target(query_target(1));
        let mut aggregator = aggregator(&provider);

        let update = doc("rooms/a", 5);
        aggregator.handle_document_change(DocumentWatchChange::new(
            vec![1],
            vec![],
            key("rooms/a"),
            Some(update.clone()),
        ));
        aggregator.handle_target_change(
            WatchTargetChange::new(WatchTargetChangeState::Current, vec![1])
                .with_resume_token(Bytes::from_static(b"t1")),
        );

        let event = aggregator.create_remote_event(version(5));
        assert_eq!(event.snapshot_version, version(5));
        assert_eq!(event.document_updates.get(&key("rooms/a")), Some(&update));
        let change = event.target_changes.get(&1).unwrap();
        assert!(change.current);
        assert_eq!(change.resume_token, Bytes::from_static(b"t1"));
        assert!(change.added_documents.contains(&key("rooms/a")));
        assert!(event.target_mismatches.is_empty());
    }

    #[test]
    fn known_documents_surface_as_modified() {
        let provider = Arc::new(TestMetadataProvider::default());
        provider.set_target(query_target(1));
        provider.set_remote_keys(1, [key("rooms/a")].into_iter().collect());
        let mut aggregator = aggregator(&provider);

        aggregator.handle_document_change(DocumentWatchChange::new(
            vec![1],
            vec![],
            key("rooms/a"),
            Some(doc("rooms/a", 6)),
        ));

        let event = aggregator.create_remote_event(version(6));
        let change = event.target_changes.get(&1).unwrap();
        assert!(change.added_documents.is_empty());
        assert!(change.modified_documents.contains(&key("rooms/a")));
    }

    #[test]
    fn changes_for_pending_targets_are_dropped_until_acked() {
        let provider = Arc::new(TestMetadataProvider::default());
        provider.set_target(query_target(1));
        let mut aggregator = aggregator(&provider);

        aggregator.record_pending_target_request(1);
        aggregator.handle_document_change(DocumentWatchChange::new(
            vec![1],
            vec![],
            key("rooms/a"),
            Some(doc("rooms/a", 4)),
        ));

        let pending = aggregator.create_remote_event(version(4));
        assert!(pending.target_changes.is_empty());
        assert!(pending.document_updates.is_empty());

        // The ack reactivates the target; later changes flow again.
        aggregator
            .handle_target_change(WatchTargetChange::new(WatchTargetChangeState::Added, vec![1]));
        aggregator.handle_document_change(DocumentWatchChange::new(
            vec![1],
            vec![],
            key("rooms/b"),
            Some(doc("rooms/b", 5)),
        ));
        let event = aggregator.create_remote_event(version(5));
        let change = event.target_changes.get(&1).unwrap();
        assert!(change.added_documents.contains(&key("rooms/b")));
    }

    #[test]
    fn existence_filter_mismatch_resets_target() {
        let provider = Arc::new(TestMetadataProvider::default());
        provider.set_target(query_target(1));
        provider.set_remote_keys(1, [key("rooms/a"), key("rooms/b")].into_iter().collect());
        let mut aggregator = aggregator(&provider);

        aggregator.handle_existence_filter(ExistenceFilterChange {
            target_id: 1,
            count: 1,
        });

        let event = aggregator.create_remote_event(version(7));
        assert!(event.target_mismatches.contains(&1));
        let change = event.target_changes.get(&1).unwrap();
        assert!(change.removed_documents.contains(&key("rooms/a")));
        assert!(change.removed_documents.contains(&key("rooms/b")));
        assert!(!change.current);
    }

    #[test]
    fn matching_existence_filter_changes_nothing() {
        let provider = Arc::new(TestMetadataProvider::default());
        provider.set_target(query_target(1));
        provider.set_remote_keys(1, [key("rooms/a")].into_iter().collect());
        let mut aggregator = aggregator(&provider);

        aggregator.handle_existence_filter(ExistenceFilterChange {
            target_id: 1,
            count: 1,
        });

        let event = aggregator.create_remote_event(version(7));
        assert!(event.target_mismatches.is_empty());
    }

    #[test]
    fn current_document_target_without_update_synthesizes_delete() {
        let provider = Arc::new(TestMetadataProvider::default());
        provider.set_target(doc_target(2, "rooms/missing", QueryPurpose::Listen));
        let mut aggregator = aggregator(&provider);

        aggregator
            .handle_target_change(WatchTargetChange::new(WatchTargetChangeState::Current, vec![2]));

        let event = aggregator.create_remote_event(version(9));
        let update = event.document_updates.get(&key("rooms/missing")).unwrap();
        assert!(update.is_no_document());
        assert_eq!(update.version(), version(9));
    }

    #[test]
    fn limbo_only_documents_are_resolved() {
        let provider = Arc::new(TestMetadataProvider::default());
        provider.set_target(doc_target(3, "rooms/limbo", QueryPurpose::LimboResolution));
        let mut aggregator = aggregator(&provider);

        aggregator.handle_document_change(DocumentWatchChange::new(
            vec![3],
            vec![],
            key("rooms/limbo"),
            Some(doc("rooms/limbo", 2)),
        ));

        let event = aggregator.create_remote_event(version(2));
        assert!(event.resolved_limbo_documents.contains(&key("rooms/limbo")));
    }

    #[test]
    fn documents_in_regular_targets_are_not_limbo_resolved() {
        let provider = Arc::new(TestMetadataProvider::default());
        provider.set_target(query_target(1));
        provider.set_target(doc_target(3, "rooms/a", QueryPurpose::LimboResolution));
        let mut aggregator = aggregator(&provider);

        aggregator.handle_document_change(DocumentWatchChange::new(
            vec![1, 3],
            vec![],
            key("rooms/a"),
            Some(doc("rooms/a", 2)),
        ));

        let event = aggregator.create_remote_event(version(2));
        assert!(event.resolved_limbo_documents.is_empty());
    }

    #[test]
    fn target_states_survive_across_events() {
        let provider = Arc::new(TestMetadataProvider::default());
        provider.set_target(query_target(1));
        let mut aggregator = aggregator(&provider);

        aggregator.handle_target_change(
            WatchTargetChange::new(WatchTargetChangeState::Current, vec![1])
                .with_resume_token(Bytes::from_static(b"t1")),
        );
        let first = aggregator.create_remote_event(version(1));
        assert!(first.target_changes.contains_key(&1));

        // Nothing new: the second event carries no change for the target.
        let second = aggregator.create_remote_event(version(2));
        assert!(second.target_changes.is_empty());

        // New token only: surfaces again with the still-current flag.
        aggregator.handle_target_change(
            WatchTargetChange::new(WatchTargetChangeState::NoChange, vec![1])
                .with_resume_token(Bytes::from_static(b"t2")),
        );
        let third = aggregator.create_remote_event(version(3));
        let change = third.target_changes.get(&1).unwrap();
        assert!(change.current);
        assert_eq!(change.resume_token, Bytes::from_static(b"t2"));
    }

    #[test]
    fn removed_target_drops_aggregation_state() {
        let provider = Arc::new(TestMetadataProvider::default());
        provider.set_target(query_target(1));
        let mut aggregator = aggregator(&provider);

        aggregator.record_pending_target_request(1);
        aggregator
            .handle_target_change(WatchTargetChange::new(WatchTargetChangeState::Removed, vec![1]));

        let event = aggregator.create_remote_event(version(1));
        assert!(event.target_changes.is_empty());
    }
}
