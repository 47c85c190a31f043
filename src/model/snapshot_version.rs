use crate::model::Timestamp;

/// Version of a document or snapshot in the server's commit order.
///
/// `SnapshotVersion::min()` marks state with no known server version, such
/// as documents that only exist locally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotVersion(Timestamp);

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    pub fn min() -> Self {
        Self(Timestamp {
            seconds: 0,
            nanos: 0,
        })
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.0
    }
}

impl Default for SnapshotVersion {
    fn default() -> Self {
        Self::min()
    }
}
