use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::core::types::OnlineState;
use crate::core::view_snapshot::{
    change_type_order, ChangeType, DocumentChangeSet, DocumentViewChange, ViewSnapshot,
};
use crate::model::{Document, DocumentKey, DocumentSet, MaybeDocument};
use crate::query::{LimitType, Query};
use crate::remote::remote_event::TargetChange;
use crate::util::assert::hard_assert;

/// A document entering or leaving limbo for this view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

/// The result of running document updates through the query, not yet
/// applied to the view.
pub struct ViewDocumentChanges {
    /// The documents that should be in the view afterwards.
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// The updates alone could not settle a limit query; the caller must
    /// re-run the query against the cache and compute again from that
    /// result.
    pub needs_refill: bool,
    pub mutated_keys: BTreeSet<DocumentKey>,
}

pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyncState {
    Local,
    Synced,
}

/// Computes the merged truth of what documents a query contains, fed by
/// both local mutations and remote target changes.
///
/// The two-phase shape matters: [`View::compute_doc_changes`] is pure and
/// may be re-run for a cache refill, while [`View::apply_changes`] commits
/// one computed result and emits at most one snapshot for it.
pub struct View {
    query: Query,
    sync_state: Option<SyncState>,
    /// Whether the backend marked the target current and the stream has not
    /// since lost consistency.
    current: bool,
    document_set: DocumentSet,
    /// Documents in the view that the remote target does not account for.
    limbo_documents: BTreeSet<DocumentKey>,
    /// Keys with unacknowledged local changes.
    mutated_keys: BTreeSet<DocumentKey>,
    /// Documents the backend has confirmed to be part of the target.
    synced_documents: BTreeSet<DocumentKey>,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        let document_set = DocumentSet::new(query.comparator());
        View {
            query,
            sync_state: None,
            current: false,
            document_set,
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
            synced_documents,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    /// Runs a batch of document updates through the query limit and
    /// computes the new result set, the delta and whether another pass over
    /// the cache is needed. Leaves the view untouched.
    ///
    /// `previous_changes` carries the result of the first pass when this is
    /// the refill pass.
    pub fn compute_doc_changes(
        &self,
        doc_changes: &BTreeMap<DocumentKey, MaybeDocument>,
        previous_changes: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let is_refill = previous_changes.is_some();
        let (mut change_set, old_document_set, mut new_mutated_keys) = match previous_changes {
            Some(previous) => (
                previous.change_set,
                previous.document_set,
                previous.mutated_keys,
            ),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut new_document_set = old_document_set.clone();
        let mut needs_refill = false;
        let comparator = self.query.comparator();

        // With a full limit result, an update can push a document over the
        // boundary or a delete can open a slot, and either way the cache may
        // hold some other document that belongs in the result. Track the
        // boundary document of the old set to detect that. A refill pass
        // only ever adds, so the boundary is irrelevant there.
        let at_limit = self
            .query
            .limit()
            .map(|limit| old_document_set.len() == limit as usize)
            .unwrap_or(false);
        let last_doc_in_limit = if at_limit && self.query.limit_type() == LimitType::First {
            old_document_set.last().cloned()
        } else {
            None
        };
        let first_doc_in_limit = if at_limit && self.query.limit_type() == LimitType::Last {
            old_document_set.first().cloned()
        } else {
            None
        };

        for (key, new_maybe_doc) in doc_changes {
            let old_doc = old_document_set.get(key).cloned();
            let new_doc = new_maybe_doc.as_document().and_then(|doc| {
                hard_assert(
                    key == doc.key(),
                    "Mismatching key found in document changes",
                );
                if self.query.matches(doc) {
                    Some(doc.clone())
                } else {
                    None
                }
            });

            let old_doc_had_pending_mutations = old_doc
                .as_ref()
                .map(|doc| self.mutated_keys.contains(doc.key()))
                .unwrap_or(false);
            // Committed mutations only count for documents the view saw
            // mutated; an unrelated committed document is as good as synced.
            let new_doc_has_pending_mutations = new_doc
                .as_ref()
                .map(|doc| {
                    doc.has_local_mutations()
                        || (self.mutated_keys.contains(doc.key())
                            && doc.has_committed_mutations())
                })
                .unwrap_or(false);

            let mut change_applied = false;
            match (&old_doc, &new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange {
                                doc: new_doc.clone(),
                                change_type: ChangeType::Modified,
                            });
                            change_applied = true;
                            if let Some(boundary) = &last_doc_in_limit {
                                if comparator(new_doc, boundary) == Ordering::Greater {
                                    // Moved past the limit; something in the
                                    // cache may now be in range.
                                    needs_refill = true;
                                }
                            }
                            if let Some(boundary) = &first_doc_in_limit {
                                if comparator(new_doc, boundary) == Ordering::Less {
                                    needs_refill = true;
                                }
                            }
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.track(DocumentViewChange {
                            doc: new_doc.clone(),
                            change_type: ChangeType::Metadata,
                        });
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange {
                        doc: new_doc.clone(),
                        change_type: ChangeType::Added,
                    });
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange {
                        doc: old_doc.clone(),
                        change_type: ChangeType::Removed,
                    });
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        // A full limit result lost a member; the cache may
                        // know the replacement.
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        let key = new_doc.key().clone();
                        new_document_set.add(new_doc);
                        if new_doc_has_pending_mutations {
                            new_mutated_keys.insert(key);
                        } else {
                            new_mutated_keys.remove(&key);
                        }
                    }
                    None => {
                        new_document_set.delete(key);
                        new_mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = self.query.limit() {
            while new_document_set.len() > limit as usize {
                let overflow = match self.query.limit_type() {
                    LimitType::First => new_document_set.last().cloned(),
                    LimitType::Last => new_document_set.first().cloned(),
                };
                let doc = match overflow {
                    Some(doc) => doc,
                    None => break,
                };
                new_document_set.delete(doc.key());
                new_mutated_keys.remove(doc.key());
                change_set.track(DocumentViewChange {
                    doc,
                    change_type: ChangeType::Removed,
                });
            }
        }

        hard_assert(
            !needs_refill || !is_refill,
            "View was refilled using docs that themselves needed refilling",
        );
        ViewDocumentChanges {
            document_set: new_document_set,
            change_set,
            needs_refill,
            mutated_keys: new_mutated_keys,
        }
    }

    /// Commits one computed result, updates limbo bookkeeping from the
    /// target change and emits a snapshot when something visible changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        update_limbo_documents: bool,
        target_change: Option<&TargetChange>,
    ) -> ViewChange {
        hard_assert(
            !doc_changes.needs_refill,
            "Cannot apply changes that need a refill",
        );
        let ViewDocumentChanges {
            document_set,
            change_set,
            needs_refill: _,
            mutated_keys,
        } = doc_changes;

        let old_documents = std::mem::replace(&mut self.document_set, document_set);
        self.mutated_keys = mutated_keys;

        let mut changes = change_set.get_changes();
        let comparator = self.query.comparator();
        changes.sort_by(|left, right| {
            change_type_order(left.change_type)
                .cmp(&change_type_order(right.change_type))
                .then_with(|| comparator(&left.doc, &right.doc))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if update_limbo_documents {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };
        let synced = self.limbo_documents.is_empty() && self.current;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = Some(new_sync_state) != self.sync_state;
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }
        ViewChange {
            snapshot: Some(ViewSnapshot {
                query: self.query.clone(),
                documents: self.document_set.clone(),
                old_documents,
                doc_changes: changes,
                mutated_keys: self.mutated_keys.clone(),
                from_cache: new_sync_state == SyncState::Local,
                sync_state_changed,
                excludes_metadata_changes: false,
            }),
            limbo_changes,
        }
    }

    /// Going offline drops `current`: snapshots raise as from-cache until a
    /// fresh target change restores consistency after reconnect.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            return self.apply_changes(
                ViewDocumentChanges {
                    document_set: self.document_set.clone(),
                    change_set: DocumentChangeSet::new(),
                    needs_refill: false,
                    mutated_keys: self.mutated_keys.clone(),
                },
                false,
                None,
            );
        }
        ViewChange {
            snapshot: None,
            limbo_changes: Vec::new(),
        }
    }

    /// Snapshot as if this query had just been listened to: every current
    /// document reported as an addition, with the established view's cache
    /// and pending-write status.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state == Some(SyncState::Local),
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let change = match target_change {
            Some(change) => change,
            None => return,
        };
        for key in &change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &change.modified_documents {
            hard_assert(
                self.synced_documents.contains(key),
                "Modified document not found in view",
            );
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        // Limbo is only decidable once the backend asserts the target is
        // complete.
        if !self.current {
            return Vec::new();
        }

        let old_limbo_documents = std::mem::take(&mut self.limbo_documents);
        let keys: Vec<DocumentKey> = self
            .document_set
            .iter()
            .map(|doc| doc.key().clone())
            .collect();
        for key in keys {
            if self.should_be_in_limbo(&key) {
                self.limbo_documents.insert(key);
            }
        }

        let mut changes = Vec::new();
        for key in &old_limbo_documents {
            if !self.limbo_documents.contains(key) {
                changes.push(LimboDocumentChange::Removed(key.clone()));
            }
        }
        for key in &self.limbo_documents {
            if !old_limbo_documents.contains(key) {
                changes.push(LimboDocumentChange::Added(key.clone()));
            }
        }
        changes
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        // The backend vouches for it.
        if self.synced_documents.contains(key) {
            return false;
        }
        let doc = match self.document_set.get(key) {
            Some(doc) => doc,
            None => return false,
        };
        // Local changes may explain why the backend does not list it yet.
        !doc.has_local_mutations()
    }
}

/// An acknowledged write is about to be followed by the same document from
/// the watch stream. Suppressing the intermediate copy raises two events
/// for the write (pending, then final) instead of three.
fn should_wait_for_synced_document(old_doc: &Document, new_doc: &Document) -> bool {
    old_doc.has_local_mutations() && new_doc.has_committed_mutations()
}
