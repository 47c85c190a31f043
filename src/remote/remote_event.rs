use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

use crate::model::{DocumentKey, MaybeDocument, SnapshotVersion};

/// Accumulated change to a single target, as of one consistent snapshot.
///
/// The document sets partition every key the snapshot touched for this
/// target: `added` keys entered the target, `modified` keys were already in
/// it and changed, `removed` keys left it. A key never appears in more than
/// one set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetChange {
    /// Opaque checkpoint. Non-empty tokens let a re-listen resume from this
    /// snapshot instead of replaying the target from scratch.
    pub resume_token: Bytes,
    /// Whether the backend has confirmed the local target state is complete
    /// up to the snapshot version.
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    /// Builds the change a view applies when acting as if the backend had
    /// marked the target current (or not), without any document or token
    /// payload. Used for events synthesized locally rather than received
    /// over the wire.
    pub fn synthesized_current_change(current: bool) -> Self {
        TargetChange {
            resume_token: Bytes::new(),
            current,
            added_documents: BTreeSet::new(),
            modified_documents: BTreeSet::new(),
            removed_documents: BTreeSet::new(),
        }
    }
}

/// One consistent view of the watch stream: every target and document change
/// accumulated since the previous event, stamped with the snapshot version
/// at which it all holds.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    /// Per-target deltas, keyed by target id.
    pub target_changes: BTreeMap<i32, TargetChange>,
    /// Targets whose local document set fell out of sync with the backend
    /// count. These must be cleared and re-listened without a resume token.
    pub target_mismatches: BTreeSet<i32>,
    /// New document states, keyed by document key. Values may be documents
    /// or tombstones.
    pub document_updates: BTreeMap<DocumentKey, MaybeDocument>,
    /// Documents previously tracked only through limbo-resolution targets
    /// that this snapshot settled one way or the other.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.target_mismatches.is_empty()
            && self.document_updates.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}
