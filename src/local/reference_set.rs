use std::collections::{BTreeMap, BTreeSet};

use crate::model::DocumentKey;

/// A many-to-many association between document keys and integer ids,
/// indexed both ways. The ids are target ids or mutation batch ids,
/// depending on who owns the set.
#[derive(Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeMap<DocumentKey, BTreeSet<i32>>,
    by_id: BTreeMap<i32, BTreeSet<DocumentKey>>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        self.by_key.entry(key.clone()).or_default().insert(id);
        self.by_id.entry(id).or_default().insert(key);
    }

    pub fn add_references<'a>(&mut self, keys: impl IntoIterator<Item = &'a DocumentKey>, id: i32) {
        for key in keys {
            self.add_reference(key.clone(), id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) {
        if let Some(ids) = self.by_key.get_mut(key) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_key.remove(key);
            }
        }
        if let Some(keys) = self.by_id.get_mut(&id) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_id.remove(&id);
            }
        }
    }

    pub fn remove_references<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        id: i32,
    ) {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference under the id and returns the keys that held
    /// one.
    pub fn remove_references_for_id(&mut self, id: i32) -> Vec<DocumentKey> {
        let keys: Vec<DocumentKey> = self
            .by_id
            .remove(&id)
            .map(|keys| keys.into_iter().collect())
            .unwrap_or_default();
        for key in &keys {
            if let Some(ids) = self.by_key.get_mut(key) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }
        keys
    }

    pub fn references_for_id(&self, id: i32) -> BTreeSet<DocumentKey> {
        self.by_id.get(&id).cloned().unwrap_or_default()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }
}
