use std::collections::{BTreeMap, BTreeSet};

use crate::local::local_documents_view::LocalDocumentsView;
use crate::model::{Document, DocumentKey, DocumentSet, MaybeDocument, SnapshotVersion};
use crate::query::{LimitType, Query};

/// Executes queries against the local view, reusing a target's previous
/// results where possible instead of scanning the whole collection.
///
/// The fast path starts from the documents the backend last confirmed for
/// the target and merges in everything that changed since the target was
/// last free of limbo documents. It is unsound only when a limit query
/// may have let documents back in from outside the confirmed set, which
/// `needs_refill` detects.
#[derive(Default)]
pub struct QueryEngine;

impl QueryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn get_documents_matching_query(
        &self,
        local_documents: &LocalDocumentsView,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Document> {
        // Unfiltered queries cannot miss documents, and a target that was
        // never current has no previous results to start from.
        if query.matches_all_documents()
            || last_limbo_free_snapshot_version == SnapshotVersion::min()
        {
            return self.execute_full_collection_scan(local_documents, query);
        }

        let documents = local_documents.get_documents(remote_keys);
        let previous_results = apply_query(query, &documents);
        if query.limit().is_some()
            && needs_refill(
                query,
                &previous_results,
                remote_keys,
                last_limbo_free_snapshot_version,
            )
        {
            return self.execute_full_collection_scan(local_documents, query);
        }

        log::debug!(
            "QueryEngine: Re-using previous result from {:?} to execute query: {}",
            last_limbo_free_snapshot_version,
            query.canonical_id()
        );
        let mut results: BTreeMap<DocumentKey, Document> = previous_results
            .iter()
            .map(|doc| (doc.key().clone(), doc.clone()))
            .collect();
        let updated =
            local_documents.get_documents_matching_query(query, last_limbo_free_snapshot_version);
        for (key, doc) in updated {
            results.insert(key, doc);
        }
        results
    }

    fn execute_full_collection_scan(
        &self,
        local_documents: &LocalDocumentsView,
        query: &Query,
    ) -> BTreeMap<DocumentKey, Document> {
        log::debug!(
            "QueryEngine: Using full collection scan to execute query: {}",
            query.canonical_id()
        );
        local_documents.get_documents_matching_query(query, SnapshotVersion::min())
    }
}

fn apply_query(query: &Query, documents: &BTreeMap<DocumentKey, MaybeDocument>) -> DocumentSet {
    let mut results = DocumentSet::new(query.comparator());
    for maybe_doc in documents.values() {
        if let MaybeDocument::Document(doc) = maybe_doc {
            if query.matches(doc) {
                results.add(doc.clone());
            }
        }
    }
    results
}

/// Whether a limit query must be re-run from scratch. The previous results
/// only stay authoritative if nothing could have entered or re-entered the
/// limit window behind the backend's back.
fn needs_refill(
    query: &Query,
    sorted_previous_results: &DocumentSet,
    remote_keys: &BTreeSet<DocumentKey>,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    // The backend's set and the local set must agree on membership;
    // otherwise a local edit moved a document out of the window and
    // another document may belong in it.
    if remote_keys.len() != sorted_previous_results.len() {
        return true;
    }
    // The document at the limit edge defines the window boundary. If it
    // has unacknowledged local changes or moved after the target was last
    // complete, the boundary itself is unreliable.
    let doc_at_limit_edge = match query.limit_type() {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    match doc_at_limit_edge {
        None => false,
        Some(doc) => {
            doc.has_pending_writes() || doc.version() > limbo_free_snapshot_version
        }
    }
}
