use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::model::{Document, DocumentKey, DocumentSet};
use crate::query::Query;
use crate::util::fail;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    Metadata,
}

/// Sort rank for emitting changes: removals first so consumers shrink
/// before they grow, then additions, then modifications. Metadata changes
/// rank with modifications.
pub fn change_type_order(change_type: ChangeType) -> u8 {
    match change_type {
        ChangeType::Removed => 0,
        ChangeType::Added => 1,
        ChangeType::Modified | ChangeType::Metadata => 2,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub doc: Document,
    pub change_type: ChangeType,
}

/// Accumulates per-document changes, collapsing sequences that cancel or
/// subsume each other so a document surfaces at most once per snapshot.
#[derive(Default)]
pub struct DocumentChangeSet {
    change_map: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.doc.key().clone();
        let old_change = match self.change_map.get(&key) {
            None => {
                self.change_map.insert(key, change);
                return;
            }
            Some(old) => old.clone(),
        };

        use ChangeType::*;
        match (change.change_type, old_change.change_type) {
            // Metadata-only states never mask a real change.
            (new_type, Metadata) if new_type != Added => {
                self.change_map.insert(key, change);
            }
            (Metadata, old_type) if old_type != Removed => {
                self.change_map.insert(
                    key,
                    DocumentViewChange {
                        doc: change.doc,
                        change_type: old_type,
                    },
                );
            }
            (Modified, Modified) => {
                self.change_map.insert(key, change);
            }
            (Modified, Added) => {
                self.change_map.insert(
                    key,
                    DocumentViewChange {
                        doc: change.doc,
                        change_type: Added,
                    },
                );
            }
            (Removed, Added) => {
                self.change_map.remove(&key);
            }
            (Removed, Modified) => {
                self.change_map.insert(
                    key,
                    DocumentViewChange {
                        doc: old_change.doc,
                        change_type: Removed,
                    },
                );
            }
            (Added, Removed) => {
                self.change_map.insert(
                    key,
                    DocumentViewChange {
                        doc: change.doc,
                        change_type: Modified,
                    },
                );
            }
            (new_type, old_type) => fail(format!(
                "unsupported combination of changes: {new_type:?} after {old_type:?}"
            )),
        }
    }

    pub fn get_changes(&self) -> Vec<DocumentViewChange> {
        self.change_map.values().cloned().collect()
    }
}

/// One consistent result of a query, with the delta that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub query: Query,
    pub documents: DocumentSet,
    pub old_documents: DocumentSet,
    pub doc_changes: Vec<DocumentViewChange>,
    pub mutated_keys: BTreeSet<DocumentKey>,
    /// The result may be missing or stale compared to the backend.
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
}

impl ViewSnapshot {
    /// Snapshot for a brand-new listener: every document is an addition.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
    ) -> Self {
        let doc_changes = documents
            .iter()
            .map(|doc| DocumentViewChange {
                doc: doc.clone(),
                change_type: ChangeType::Added,
            })
            .collect();
        let old_documents = DocumentSet::new(query.comparator());
        Self {
            query,
            documents,
            old_documents,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocumentState, ObjectValue, SnapshotVersion, Timestamp};
    use serde_json::json;

    fn doc(path: &str, counter: i64) -> Document {
        Document::new(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            ObjectValue::from_json(json!({ "counter": counter })).unwrap(),
            DocumentState::Synced,
        )
    }

    fn change(path: &str, counter: i64, change_type: ChangeType) -> DocumentViewChange {
        DocumentViewChange {
            doc: doc(path, counter),
            change_type,
        }
    }

    #[test]
    fn add_then_modify_stays_an_add() {
        let mut set = DocumentChangeSet::new();
        set.track(change("rooms/a", 1, ChangeType::Added));
        set.track(change("rooms/a", 2, ChangeType::Modified));
        let changes = set.get_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Added);
        assert_eq!(changes[0].doc, doc("rooms/a", 2));
    }

    #[test]
    fn add_then_remove_cancels_out() {
        let mut set = DocumentChangeSet::new();
        set.track(change("rooms/a", 1, ChangeType::Added));
        set.track(change("rooms/a", 1, ChangeType::Removed));
        assert!(set.get_changes().is_empty());
    }

    #[test]
    fn remove_then_add_becomes_a_modification() {
        let mut set = DocumentChangeSet::new();
        set.track(change("rooms/a", 1, ChangeType::Removed));
        set.track(change("rooms/a", 2, ChangeType::Added));
        let changes = set.get_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Modified);
    }

    #[test]
    fn modify_then_remove_keeps_the_last_real_contents() {
        let mut set = DocumentChangeSet::new();
        set.track(change("rooms/a", 1, ChangeType::Modified));
        set.track(change("rooms/a", 2, ChangeType::Removed));
        let changes = set.get_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Removed);
        assert_eq!(changes[0].doc, doc("rooms/a", 1));
    }

    #[test]
    fn metadata_never_downgrades_a_real_change() {
        let mut set = DocumentChangeSet::new();
        set.track(change("rooms/a", 1, ChangeType::Added));
        set.track(change("rooms/a", 2, ChangeType::Metadata));
        let changes = set.get_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Added);
        assert_eq!(changes[0].doc, doc("rooms/a", 2));
    }

    #[test]
    fn initial_snapshot_reports_every_document_as_added() {
        let query = Query::at_path(crate::model::ResourcePath::from_string("rooms").unwrap());
        let mut documents = DocumentSet::new(query.comparator());
        documents.add(doc("rooms/a", 1));
        documents.add(doc("rooms/b", 2));
        let snapshot = ViewSnapshot::from_initial_documents(
            query,
            documents,
            BTreeSet::new(),
            true,
        );
        assert_eq!(snapshot.doc_changes.len(), 2);
        assert!(snapshot
            .doc_changes
            .iter()
            .all(|c| c.change_type == ChangeType::Added));
        assert!(snapshot.sync_state_changed);
        assert!(!snapshot.has_pending_writes());
    }
}
