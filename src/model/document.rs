use std::cmp::Ordering;

use crate::model::{DocumentKey, FieldPath, ObjectValue, SnapshotVersion};
use crate::value::Value;

/// Tracks which pipeline stage a document's local view reflects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentState {
    /// The document matches what the backend last told us.
    Synced,
    /// Local mutations are applied on top of the backend state.
    LocalMutations,
    /// Mutations were acknowledged but the updated document has not yet
    /// arrived on the listen channel.
    CommittedMutations,
}

/// A document that exists, together with its contents.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    key: DocumentKey,
    version: SnapshotVersion,
    data: ObjectValue,
    state: DocumentState,
}

impl Document {
    pub fn new(
        key: DocumentKey,
        version: SnapshotVersion,
        data: ObjectValue,
        state: DocumentState,
    ) -> Self {
        Self {
            key,
            version,
            data,
            state,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn data(&self) -> &ObjectValue {
        &self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&Value> {
        self.data.field(path)
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    pub fn has_local_mutations(&self) -> bool {
        self.state == DocumentState::LocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.state == DocumentState::CommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.state != DocumentState::Synced
    }

    pub fn compare_by_key(left: &Document, right: &Document) -> Ordering {
        left.key.cmp(&right.key)
    }
}

/// A document known not to exist at a given version.
#[derive(Clone, Debug, PartialEq)]
pub struct NoDocument {
    key: DocumentKey,
    version: SnapshotVersion,
    has_committed_mutations: bool,
}

impl NoDocument {
    pub fn new(key: DocumentKey, version: SnapshotVersion, has_committed_mutations: bool) -> Self {
        Self {
            key,
            version,
            has_committed_mutations,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.has_committed_mutations
    }
}

/// A document whose existence was acknowledged but whose contents are
/// unknown, produced when a patch commits without the updated contents.
#[derive(Clone, Debug, PartialEq)]
pub struct UnknownDocument {
    key: DocumentKey,
    version: SnapshotVersion,
}

impl UnknownDocument {
    pub fn new(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self { key, version }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }
}

/// Everything the local cache can know about a document.
#[derive(Clone, Debug, PartialEq)]
pub enum MaybeDocument {
    Document(Document),
    NoDocument(NoDocument),
    UnknownDocument(UnknownDocument),
}

impl MaybeDocument {
    pub fn key(&self) -> &DocumentKey {
        match self {
            MaybeDocument::Document(doc) => doc.key(),
            MaybeDocument::NoDocument(doc) => doc.key(),
            MaybeDocument::UnknownDocument(doc) => doc.key(),
        }
    }

    pub fn version(&self) -> SnapshotVersion {
        match self {
            MaybeDocument::Document(doc) => doc.version(),
            MaybeDocument::NoDocument(doc) => doc.version(),
            MaybeDocument::UnknownDocument(doc) => doc.version(),
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        match self {
            MaybeDocument::Document(doc) => doc.has_pending_writes(),
            MaybeDocument::NoDocument(doc) => doc.has_committed_mutations(),
            MaybeDocument::UnknownDocument(_) => true,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            MaybeDocument::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn is_document(&self) -> bool {
        matches!(self, MaybeDocument::Document(_))
    }

    pub fn is_no_document(&self) -> bool {
        matches!(self, MaybeDocument::NoDocument(_))
    }
}

impl From<Document> for MaybeDocument {
    fn from(doc: Document) -> Self {
        MaybeDocument::Document(doc)
    }
}

impl From<NoDocument> for MaybeDocument {
    fn from(doc: NoDocument) -> Self {
        MaybeDocument::NoDocument(doc)
    }
}

impl From<UnknownDocument> for MaybeDocument {
    fn from(doc: UnknownDocument) -> Self {
        MaybeDocument::UnknownDocument(doc)
    }
}
