use std::collections::BTreeSet;

use crate::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::model::DocumentKey;

/// A view's membership delta, reported back to the local store so document
/// references track what the views are actually showing.
#[derive(Clone, Debug)]
pub struct LocalViewChanges {
    pub target_id: i32,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

impl LocalViewChanges {
    pub fn from_snapshot(target_id: i32, view_snapshot: &ViewSnapshot) -> Self {
        let mut added_keys = BTreeSet::new();
        let mut removed_keys = BTreeSet::new();
        for doc_change in &view_snapshot.doc_changes {
            match doc_change.change_type {
                ChangeType::Added => {
                    added_keys.insert(doc_change.doc.key().clone());
                }
                ChangeType::Removed => {
                    removed_keys.insert(doc_change.doc.key().clone());
                }
                _ => {}
            }
        }
        Self {
            target_id,
            from_cache: view_snapshot.from_cache,
            added_keys,
            removed_keys,
        }
    }
}
