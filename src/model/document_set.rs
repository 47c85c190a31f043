use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::model::{Document, DocumentKey};

pub type DocumentComparator = dyn Fn(&Document, &Document) -> Ordering + Send + Sync;

/// An ordered set of documents, sorted by a query comparator and indexed
/// by key. Comparators must tie-break by key so the order is total.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: Arc<DocumentComparator>,
    sorted: Vec<Document>,
    by_key: BTreeMap<DocumentKey, Document>,
}

impl DocumentSet {
    pub fn new(comparator: Arc<DocumentComparator>) -> Self {
        Self {
            comparator,
            sorted: Vec::new(),
            by_key: BTreeMap::new(),
        }
    }

    /// Set ordered purely by document key.
    pub fn by_key() -> Self {
        Self::new(Arc::new(Document::compare_by_key))
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        if !self.by_key.contains_key(key) {
            return None;
        }
        self.sorted.iter().position(|doc| doc.key() == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.sorted.iter()
    }

    /// Inserts a document, replacing any previous revision under the same
    /// key and re-sorting it into position.
    pub fn add(&mut self, doc: Document) {
        self.delete(doc.key());
        let position = match self
            .sorted
            .binary_search_by(|probe| (self.comparator)(probe, &doc))
        {
            Ok(position) => position,
            Err(position) => position,
        };
        self.sorted.insert(position, doc.clone());
        self.by_key.insert(doc.key().clone(), doc);
    }

    pub fn delete(&mut self, key: &DocumentKey) {
        let Some(existing) = self.by_key.remove(key) else {
            return;
        };
        match self
            .sorted
            .binary_search_by(|probe| (self.comparator)(probe, &existing))
        {
            Ok(position) => {
                self.sorted.remove(position);
            }
            // Comparators tie-break by key, so the keyed entry is found
            // above; this path only guards a broken comparator.
            Err(_) => self.sorted.retain(|doc| doc.key() != key),
        }
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.sorted.iter().map(|doc| doc.key()))
            .finish()
    }
}
