use std::cmp::Ordering;
use std::fmt;

use crate::error::{invalid_argument, StoreResult};
use crate::model::ResourcePath;

/// Path uniquely identifying a document: an even, non-empty segment count.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> StoreResult<Self> {
        if !Self::is_document_path(&path) {
            return Err(invalid_argument(format!(
                "invalid document path \"{path}\": expected a non-empty even number of segments"
            )));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> StoreResult<Self> {
        Self::from_path(ResourcePath::from_string(path)?)
    }

    pub fn is_document_path(path: &ResourcePath) -> bool {
        !path.is_empty() && path.len() % 2 == 0
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// The document id, which is the final path segment.
    pub fn id(&self) -> &str {
        self.path
            .last_segment()
            .expect("document keys always have segments")
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.pop_last()
    }

    /// The id of the collection containing this document.
    pub fn collection_id(&self) -> &str {
        &self.path[self.path.len() - 2]
    }

    pub fn has_collection_id(&self, collection_id: &str) -> bool {
        self.collection_id() == collection_id
    }
}

impl Ord for DocumentKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.path.cmp(&other.path)
    }
}

impl PartialOrd for DocumentKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}
