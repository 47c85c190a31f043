use bytes::Bytes;

use crate::local::listen_sequence::ListenSequenceNumber;
use crate::model::SnapshotVersion;
use crate::query::Target;

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryPurpose {
    /// A client-issued query.
    Listen,
    /// A re-listen after the backend signalled that our cached results
    /// diverged from the server's.
    ExistenceFilterMismatch,
    /// A single-document listen resolving a limbo document.
    LimboResolution,
}

/// Everything the local store tracks about an allocated target.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Target,
    pub target_id: i32,
    pub sequence_number: ListenSequenceNumber,
    pub purpose: QueryPurpose,
    /// Latest snapshot version the backend has shown us for this target.
    pub snapshot_version: SnapshotVersion,
    /// Latest snapshot version at which the target was known to have no
    /// limbo documents. Gates the cached-results fast path when the query
    /// runs locally.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    /// Opaque token that resumes the backend listen where it left off.
    pub resume_token: Bytes,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: i32,
        sequence_number: ListenSequenceNumber,
        purpose: QueryPurpose,
    ) -> Self {
        Self {
            target,
            target_id,
            sequence_number,
            purpose,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Bytes::new(),
        }
    }

    pub fn with_resume_token(mut self, resume_token: Bytes, snapshot_version: SnapshotVersion) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        self
    }

    pub fn with_sequence_number(mut self, sequence_number: ListenSequenceNumber) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }
}
