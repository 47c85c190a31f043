use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::local::listen_sequence::ListenSequenceNumber;
use crate::local::reference_set::ReferenceSet;
use crate::local::target_data::TargetData;
use crate::model::DocumentKey;

/// Context for a unit of work against the local stores. Every transaction
/// carries the sequence number assigned to it, which garbage collection
/// uses to order target and document activity.
pub struct PersistenceTransaction {
    current_sequence_number: ListenSequenceNumber,
}

impl PersistenceTransaction {
    pub fn new(current_sequence_number: ListenSequenceNumber) -> Self {
        Self {
            current_sequence_number,
        }
    }

    pub fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.current_sequence_number
    }
}

/// Receives notifications about document references as targets are updated,
/// and decides what those references mean for document lifetime. The eager
/// implementation drops unreferenced documents when a transaction commits;
/// the LRU implementation records activity and defers removal to the
/// garbage collector.
pub trait ReferenceDelegate: Send + Sync {
    fn on_transaction_started(&self, txn: &PersistenceTransaction);

    fn on_transaction_committed(&self, txn: &PersistenceTransaction);

    /// A target started tracking the document.
    fn add_reference(&self, txn: &PersistenceTransaction, target_id: i32, key: &DocumentKey);

    /// A target stopped tracking the document.
    fn remove_reference(&self, txn: &PersistenceTransaction, target_id: i32, key: &DocumentKey);

    /// The document may no longer be referenced from anywhere, for example
    /// after a mutation batch that wrote it was acknowledged or rejected.
    fn mark_potentially_orphaned(&self, txn: &PersistenceTransaction, key: &DocumentKey);

    /// The target was released by the client.
    fn remove_target(&self, txn: &PersistenceTransaction, target_data: &TargetData);

    /// A document fetched through a limbo target was reconciled.
    fn update_limbo_document(&self, txn: &PersistenceTransaction, key: &DocumentKey);

    /// Installs the set of keys the in-memory view layer is holding on to.
    /// Pinned documents survive even with no target referencing them.
    fn set_in_memory_pins(&self, pins: Arc<Mutex<ReferenceSet>>);
}

/// The persistence-side surface the LRU garbage collector runs against.
pub trait LruDelegate: Send + Sync {
    fn for_each_target(&self, f: &mut dyn FnMut(&TargetData));

    /// Number of sequence numbers eligible for collection: one per target
    /// plus one per orphaned document.
    fn sequence_number_count(&self) -> usize;

    fn for_each_orphaned_document_sequence_number(
        &self,
        f: &mut dyn FnMut(ListenSequenceNumber),
    );

    /// Removes targets at or below `upper_bound` that are not currently
    /// active, returning how many were removed.
    fn remove_targets(
        &self,
        txn: &PersistenceTransaction,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<i32>,
    ) -> usize;

    /// Removes orphaned documents whose recorded sequence number is at or
    /// below `upper_bound`, returning how many were removed.
    fn remove_orphaned_documents(
        &self,
        txn: &PersistenceTransaction,
        upper_bound: ListenSequenceNumber,
    ) -> usize;

    fn cache_byte_size(&self) -> usize;
}
