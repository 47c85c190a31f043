use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::model::{Document, DocumentKey, MaybeDocument, SnapshotVersion};
use crate::query::Query;
use crate::util::hard_assert;
use crate::value::Value;

struct CacheEntry {
    doc: MaybeDocument,
    read_time: SnapshotVersion,
    size: usize,
}

/// The backend's view of documents, as far as this client has seen it.
/// Entries carry the snapshot version at which they were read so queries
/// can ask only for documents that changed since a known version.
#[derive(Default)]
pub struct MemoryRemoteDocumentCache {
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    docs: BTreeMap<DocumentKey, CacheEntry>,
    byte_size: usize,
}

impl MemoryRemoteDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&self, doc: MaybeDocument, read_time: SnapshotVersion) {
        let mut state = self.state.lock().unwrap();
        let size = document_byte_size(&doc);
        let previous = state.docs.insert(
            doc.key().clone(),
            CacheEntry {
                doc,
                read_time,
                size,
            },
        );
        state.byte_size += size;
        if let Some(previous) = previous {
            state.byte_size -= previous.size;
        }
    }

    pub fn remove_entry(&self, key: &DocumentKey) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.docs.remove(key) {
            state.byte_size -= entry.size;
        }
    }

    pub fn get_entry(&self, key: &DocumentKey) -> Option<MaybeDocument> {
        let state = self.state.lock().unwrap();
        state.docs.get(key).map(|entry| entry.doc.clone())
    }

    /// Looks up all keys at once, keeping missing keys in the result so
    /// callers can distinguish "not cached" from "does not exist".
    pub fn get_entries(
        &self,
        keys: impl IntoIterator<Item = DocumentKey>,
    ) -> BTreeMap<DocumentKey, Option<MaybeDocument>> {
        let state = self.state.lock().unwrap();
        keys.into_iter()
            .map(|key| {
                let doc = state.docs.get(&key).map(|entry| entry.doc.clone());
                (key, doc)
            })
            .collect()
    }

    /// Existing documents under the query path that changed after
    /// `since_read_time` and match the query. Collection group queries are
    /// decomposed by the caller.
    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> BTreeMap<DocumentKey, Document> {
        hard_assert(
            !query.is_collection_group_query(),
            "collection group queries are handled per parent collection",
        );
        let state = self.state.lock().unwrap();
        let mut results = BTreeMap::new();
        for (key, entry) in state.docs.iter() {
            if !query.path().is_prefix_of(key.path()) {
                continue;
            }
            if entry.read_time <= since_read_time {
                continue;
            }
            if let MaybeDocument::Document(doc) = &entry.doc {
                if query.matches(doc) {
                    results.insert(key.clone(), doc.clone());
                }
            }
        }
        results
    }

    pub fn keys(&self) -> Vec<DocumentKey> {
        let state = self.state.lock().unwrap();
        state.docs.keys().cloned().collect()
    }

    /// Estimated bytes held by the cache, for the LRU threshold check.
    pub fn byte_size(&self) -> usize {
        self.state.lock().unwrap().byte_size
    }
}

fn document_byte_size(doc: &MaybeDocument) -> usize {
    let key_size = doc.key().path().canonical_string().len();
    let contents_size = match doc {
        MaybeDocument::Document(doc) => value_byte_size(&doc.data().clone().into_value()),
        MaybeDocument::NoDocument(_) | MaybeDocument::UnknownDocument(_) => 16,
    };
    key_size + contents_size
}

fn value_byte_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Boolean(_) => 4,
        Value::Integer(_) | Value::Double(_) => 8,
        Value::Timestamp(_) | Value::GeoPoint { .. } => 16,
        Value::ServerTimestamp { previous, .. } => {
            16 + previous.as_deref().map(value_byte_size).unwrap_or(0)
        }
        Value::String(s) => s.len(),
        Value::Bytes(b) => b.len(),
        Value::Reference(key) => key.path().canonical_string().len(),
        Value::Array(values) => values.iter().map(value_byte_size).sum(),
        Value::Map(fields) => fields
            .iter()
            .map(|(k, v)| k.len() + value_byte_size(v))
            .sum(),
    }
}
