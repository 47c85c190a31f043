use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::local::mutation_queue::MemoryMutationQueue;
use crate::local::remote_document_cache::MemoryRemoteDocumentCache;
use crate::model::{
    Document, DocumentKey, MaybeDocument, MutationBatch, NoDocument, SnapshotVersion,
};
use crate::query::Query;

/// The local view of documents: what the backend has told us, overlaid
/// with the user's pending writes.
pub struct LocalDocumentsView {
    remote_documents: Arc<MemoryRemoteDocumentCache>,
    mutation_queue: Arc<MemoryMutationQueue>,
}

impl LocalDocumentsView {
    pub fn new(
        remote_documents: Arc<MemoryRemoteDocumentCache>,
        mutation_queue: Arc<MemoryMutationQueue>,
    ) -> Self {
        Self {
            remote_documents,
            mutation_queue,
        }
    }

    pub fn get_document(&self, key: &DocumentKey) -> Option<MaybeDocument> {
        let batches = self
            .mutation_queue
            .all_mutation_batches_affecting_document_key(key);
        self.get_document_with_batches(key, &batches)
    }

    fn get_document_with_batches(
        &self,
        key: &DocumentKey,
        batches: &[MutationBatch],
    ) -> Option<MaybeDocument> {
        let mut local_view = self.remote_documents.get_entry(key);
        for batch in batches {
            local_view = batch.apply_to_local_view(key, local_view);
        }
        local_view
    }

    /// The local view of all given keys. Keys with no known state come
    /// back as tombstones at the minimum version, so every requested key
    /// is present in the result.
    pub fn get_documents(
        &self,
        keys: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, MaybeDocument> {
        let base = self.remote_documents.get_entries(keys.iter().cloned());
        self.get_local_view_of_documents(base)
    }

    pub fn get_local_view_of_documents(
        &self,
        base: BTreeMap<DocumentKey, Option<MaybeDocument>>,
    ) -> BTreeMap<DocumentKey, MaybeDocument> {
        let keys: BTreeSet<DocumentKey> = base.keys().cloned().collect();
        let batches = self
            .mutation_queue
            .all_mutation_batches_affecting_document_keys(&keys);
        base.into_iter()
            .map(|(key, mut local_view)| {
                for batch in &batches {
                    local_view = batch.apply_to_local_view(&key, local_view);
                }
                let doc = local_view
                    .unwrap_or_else(|| NoDocument::new(key.clone(), SnapshotVersion::min(), false).into());
                (key, doc)
            })
            .collect()
    }

    /// Documents matching the query under the local view. `since_read_time`
    /// restricts the cache scan to documents read after that version; pass
    /// the minimum version for a full scan.
    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> BTreeMap<DocumentKey, Document> {
        if query.is_document_query() {
            self.get_documents_matching_document_query(query)
        } else if query.is_collection_group_query() {
            self.get_documents_matching_collection_group_query(query)
        } else {
            self.get_documents_matching_collection_query(query, since_read_time)
        }
    }

    fn get_documents_matching_document_query(
        &self,
        query: &Query,
    ) -> BTreeMap<DocumentKey, Document> {
        let mut results = BTreeMap::new();
        // Document queries have a valid document path by construction.
        if let Ok(key) = DocumentKey::from_path(query.path().clone()) {
            if let Some(MaybeDocument::Document(doc)) = self.get_document(&key) {
                results.insert(key, doc);
            }
        }
        results
    }

    fn get_documents_matching_collection_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> BTreeMap<DocumentKey, Document> {
        let mut working: BTreeMap<DocumentKey, MaybeDocument> = self
            .remote_documents
            .get_documents_matching_query(query, since_read_time)
            .into_iter()
            .map(|(key, doc)| (key, MaybeDocument::Document(doc)))
            .collect();
        // A pending write can make a document match even though the cached
        // revision does not, so fold every affecting batch in.
        let batches = self.mutation_queue.all_mutation_batches_affecting_query(query);
        for batch in &batches {
            batch.apply_to_local_document_set(&mut working);
        }
        filter_matching(working, query)
    }

    fn get_documents_matching_collection_group_query(
        &self,
        query: &Query,
    ) -> BTreeMap<DocumentKey, Document> {
        let group = match query.collection_group_id() {
            Some(group) => group,
            None => return BTreeMap::new(),
        };
        let mut candidates: BTreeSet<DocumentKey> = self
            .remote_documents
            .keys()
            .into_iter()
            .filter(|key| key.has_collection_id(group))
            .collect();
        for batch in self.mutation_queue.all_mutation_batches() {
            candidates.extend(
                batch
                    .keys()
                    .into_iter()
                    .filter(|key| key.has_collection_id(group)),
            );
        }
        let docs = self.get_documents(&candidates);
        filter_matching(docs, query)
    }
}

fn filter_matching(
    docs: BTreeMap<DocumentKey, MaybeDocument>,
    query: &Query,
) -> BTreeMap<DocumentKey, Document> {
    docs.into_iter()
        .filter_map(|(key, doc)| match doc {
            MaybeDocument::Document(doc) if query.matches(&doc) => Some((key, doc)),
            _ => None,
        })
        .collect()
}
