use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::local::listen_sequence::ListenSequenceNumber;
use crate::local::reference_set::ReferenceSet;
use crate::local::target_data::TargetData;
use crate::local::target_id_generator::TargetIdGenerator;
use crate::model::{DocumentKey, SnapshotVersion};
use crate::query::Target;

/// Tracks allocated targets, their resume state, and which documents each
/// target currently contains.
#[derive(Default)]
pub struct MemoryTargetCache {
    state: Mutex<TargetCacheState>,
}

struct TargetCacheState {
    targets: BTreeMap<String, TargetData>,
    references: ReferenceSet,
    last_remote_snapshot_version: SnapshotVersion,
    highest_sequence_number: ListenSequenceNumber,
    target_id_generator: TargetIdGenerator,
}

impl Default for TargetCacheState {
    fn default() -> Self {
        Self {
            targets: BTreeMap::new(),
            references: ReferenceSet::new(),
            last_remote_snapshot_version: SnapshotVersion::min(),
            highest_sequence_number: 0,
            target_id_generator: TargetIdGenerator::for_target_cache(),
        }
    }
}

impl MemoryTargetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_target_id(&self) -> i32 {
        self.state.lock().unwrap().target_id_generator.next()
    }

    pub fn add_target_data(&self, target_data: TargetData) {
        self.save(target_data);
    }

    pub fn update_target_data(&self, target_data: TargetData) {
        self.save(target_data);
    }

    fn save(&self, target_data: TargetData) {
        let mut state = self.state.lock().unwrap();
        state.highest_sequence_number = state
            .highest_sequence_number
            .max(target_data.sequence_number);
        state
            .targets
            .insert(target_data.target.canonical_id(), target_data);
    }

    pub fn remove_target_data(&self, target_data: &TargetData) {
        let mut state = self.state.lock().unwrap();
        state.targets.remove(&target_data.target.canonical_id());
        state.references.remove_references_for_id(target_data.target_id);
    }

    /// Drops every target at or below the sequence bound that is not
    /// currently active. Returns how many went.
    pub fn remove_targets(
        &self,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<i32>,
    ) -> usize {
        let mut state = self.state.lock().unwrap();
        let doomed: Vec<(String, i32)> = state
            .targets
            .iter()
            .filter(|(_, data)| {
                data.sequence_number <= upper_bound
                    && !active_target_ids.contains(&data.target_id)
            })
            .map(|(canonical_id, data)| (canonical_id.clone(), data.target_id))
            .collect();
        for (canonical_id, target_id) in &doomed {
            state.targets.remove(canonical_id);
            state.references.remove_references_for_id(*target_id);
        }
        doomed.len()
    }

    pub fn get_target_data(&self, target: &Target) -> Option<TargetData> {
        let state = self.state.lock().unwrap();
        state.targets.get(&target.canonical_id()).cloned()
    }

    pub fn target_count(&self) -> usize {
        self.state.lock().unwrap().targets.len()
    }

    pub fn for_each_target(&self, mut f: impl FnMut(&TargetData)) {
        let state = self.state.lock().unwrap();
        for target_data in state.targets.values() {
            f(target_data);
        }
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.state.lock().unwrap().last_remote_snapshot_version
    }

    pub fn set_last_remote_snapshot_version(&self, version: SnapshotVersion) {
        self.state.lock().unwrap().last_remote_snapshot_version = version;
    }

    pub fn highest_sequence_number(&self) -> ListenSequenceNumber {
        self.state.lock().unwrap().highest_sequence_number
    }

    pub fn add_matching_keys(&self, keys: &BTreeSet<DocumentKey>, target_id: i32) {
        let mut state = self.state.lock().unwrap();
        state.references.add_references(keys, target_id);
    }

    pub fn remove_matching_keys(&self, keys: &BTreeSet<DocumentKey>, target_id: i32) {
        let mut state = self.state.lock().unwrap();
        state.references.remove_references(keys, target_id);
    }

    pub fn matching_keys_for_target_id(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.state.lock().unwrap().references.references_for_id(target_id)
    }

    /// Whether any allocated target currently contains the document.
    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.state.lock().unwrap().references.contains_key(key)
    }
}
