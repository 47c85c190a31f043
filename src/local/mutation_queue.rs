use std::collections::BTreeSet;
use std::sync::Mutex;

use bytes::Bytes;

use crate::model::{DocumentKey, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN};
use crate::query::Query;
use crate::util::hard_assert;

/// The pending writes of one user, in commit order.
///
/// Batches are acknowledged or rejected strictly in order, so removal is
/// only ever from the front of the queue. Lookups by id exploit the
/// contiguous ids: a batch's position is its id offset from the front.
#[derive(Default)]
pub struct MemoryMutationQueue {
    state: Mutex<QueueState>,
}

struct QueueState {
    queue: Vec<MutationBatch>,
    next_batch_id: i32,
    batches_by_document_key: BTreeSet<(DocumentKey, i32)>,
    last_stream_token: Bytes,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            queue: Vec::new(),
            next_batch_id: 1,
            batches_by_document_key: BTreeSet::new(),
            last_stream_token: Bytes::new(),
        }
    }
}

impl MemoryMutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().queue.is_empty()
    }

    pub fn add_mutation_batch(
        &self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> MutationBatch {
        hard_assert(!mutations.is_empty(), "mutation batches must not be empty");
        let mut state = self.state.lock().unwrap();
        let batch_id = state.next_batch_id;
        state.next_batch_id += 1;
        if let Some(last) = state.queue.last() {
            hard_assert(
                batch_id > last.batch_id,
                "mutation batch ids must be issued in order",
            );
        }
        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        for mutation in &batch.mutations {
            state
                .batches_by_document_key
                .insert((mutation.key().clone(), batch_id));
        }
        state.queue.push(batch.clone());
        batch
    }

    pub fn lookup_mutation_batch(&self, batch_id: i32) -> Option<MutationBatch> {
        let state = self.state.lock().unwrap();
        index_of_batch_id(&state, batch_id)
            .and_then(|index| state.queue.get(index))
            .cloned()
    }

    /// The first batch after `batch_id`, normalizing ids before the front
    /// of the queue to the front.
    pub fn next_mutation_batch_after_batch_id(&self, batch_id: i32) -> Option<MutationBatch> {
        let state = self.state.lock().unwrap();
        let first = match state.queue.first() {
            Some(batch) => batch.batch_id,
            None => return None,
        };
        let next_index = (batch_id + 1 - first).max(0) as usize;
        state.queue.get(next_index).cloned()
    }

    pub fn highest_unacknowledged_batch_id(&self) -> i32 {
        let state = self.state.lock().unwrap();
        state
            .queue
            .last()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    pub fn all_mutation_batches(&self) -> Vec<MutationBatch> {
        self.state.lock().unwrap().queue.clone()
    }

    pub fn all_mutation_batches_affecting_document_key(
        &self,
        key: &DocumentKey,
    ) -> Vec<MutationBatch> {
        let state = self.state.lock().unwrap();
        let ids: BTreeSet<i32> = state
            .batches_by_document_key
            .range((key.clone(), i32::MIN)..=(key.clone(), i32::MAX))
            .map(|(_, batch_id)| *batch_id)
            .collect();
        find_mutation_batches(&state, ids)
    }

    pub fn all_mutation_batches_affecting_document_keys(
        &self,
        keys: &BTreeSet<DocumentKey>,
    ) -> Vec<MutationBatch> {
        let state = self.state.lock().unwrap();
        let mut ids = BTreeSet::new();
        for key in keys {
            ids.extend(
                state
                    .batches_by_document_key
                    .range((key.clone(), i32::MIN)..=(key.clone(), i32::MAX))
                    .map(|(_, batch_id)| *batch_id),
            );
        }
        find_mutation_batches(&state, ids)
    }

    /// Batches touching documents directly inside the query's collection.
    pub fn all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<MutationBatch> {
        hard_assert(
            !query.is_collection_group_query(),
            "collection group queries are handled per parent collection",
        );
        let prefix = query.path();
        let immediate_children_length = prefix.len() + 1;
        let state = self.state.lock().unwrap();
        let mut ids = BTreeSet::new();
        for (key, batch_id) in state.batches_by_document_key.iter() {
            if !prefix.is_prefix_of(key.path()) {
                continue;
            }
            if key.path().len() == immediate_children_length {
                ids.insert(*batch_id);
            }
        }
        find_mutation_batches(&state, ids)
    }

    /// Removes an acknowledged or rejected batch. Only the front of the
    /// queue can go.
    pub fn remove_mutation_batch(&self, batch: &MutationBatch) {
        let mut state = self.state.lock().unwrap();
        let index = index_of_batch_id(&state, batch.batch_id);
        hard_assert(
            index == Some(0),
            "can only remove the first entry of the mutation queue",
        );
        state.queue.remove(0);
        for mutation in &batch.mutations {
            state
                .batches_by_document_key
                .remove(&(mutation.key().clone(), batch.batch_id));
        }
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        let state = self.state.lock().unwrap();
        state
            .batches_by_document_key
            .range((key.clone(), i32::MIN)..=(key.clone(), i32::MAX))
            .next()
            .is_some()
    }

    pub fn perform_consistency_check(&self) {
        let state = self.state.lock().unwrap();
        if state.queue.is_empty() {
            hard_assert(
                state.batches_by_document_key.is_empty(),
                "document leak: an empty mutation queue still holds document references",
            );
        }
    }

    pub fn last_stream_token(&self) -> Bytes {
        self.state.lock().unwrap().last_stream_token.clone()
    }

    pub fn set_last_stream_token(&self, token: Bytes) {
        self.state.lock().unwrap().last_stream_token = token;
    }
}

fn index_of_batch_id(state: &QueueState, batch_id: i32) -> Option<usize> {
    let first = state.queue.first()?.batch_id;
    let index = batch_id - first;
    if index < 0 || index as usize >= state.queue.len() {
        None
    } else {
        Some(index as usize)
    }
}

fn find_mutation_batches(state: &QueueState, ids: BTreeSet<i32>) -> Vec<MutationBatch> {
    ids.into_iter()
        .filter_map(|batch_id| {
            index_of_batch_id(state, batch_id).and_then(|index| state.queue.get(index).cloned())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ObjectValue, Precondition, ResourcePath};
    use serde_json::json;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn set_mutation(path: &str) -> Mutation {
        Mutation::Set {
            key: key(path),
            value: ObjectValue::from_json(json!({})).unwrap(),
            precondition: Precondition::None,
        }
    }

    fn add_batch(queue: &MemoryMutationQueue, paths: &[&str]) -> MutationBatch {
        queue.add_mutation_batch(
            Timestamp::new(1, 0),
            vec![],
            paths.iter().map(|p| set_mutation(p)).collect(),
        )
    }

    #[test]
    fn batch_ids_are_contiguous_from_one() {
        let queue = MemoryMutationQueue::new();
        assert_eq!(add_batch(&queue, &["rooms/a"]).batch_id, 1);
        assert_eq!(add_batch(&queue, &["rooms/b"]).batch_id, 2);
        assert_eq!(queue.highest_unacknowledged_batch_id(), 2);
        assert_eq!(queue.lookup_mutation_batch(1).unwrap().batch_id, 1);
        assert_eq!(queue.lookup_mutation_batch(9), None);
    }

    #[test]
    fn next_after_normalizes_out_of_range_ids() {
        let queue = MemoryMutationQueue::new();
        let first = add_batch(&queue, &["rooms/a"]);
        let second = add_batch(&queue, &["rooms/b"]);
        queue.remove_mutation_batch(&first);

        // An id before the queue front resolves to the front.
        assert_eq!(
            queue.next_mutation_batch_after_batch_id(BATCH_ID_UNKNOWN),
            Some(second.clone())
        );
        assert_eq!(queue.next_mutation_batch_after_batch_id(1), Some(second));
        assert_eq!(queue.next_mutation_batch_after_batch_id(2), None);
    }

    #[test]
    fn lookups_by_key_and_query() {
        let queue = MemoryMutationQueue::new();
        add_batch(&queue, &["rooms/a"]);
        add_batch(&queue, &["rooms/b", "rooms/a"]);
        add_batch(&queue, &["rooms/a/messages/m"]);

        let for_key = queue.all_mutation_batches_affecting_document_key(&key("rooms/a"));
        assert_eq!(
            for_key.iter().map(|b| b.batch_id).collect::<Vec<_>>(),
            vec![1, 2]
        );

        let query = Query::at_path(ResourcePath::from_string("rooms").unwrap());
        let for_query = queue.all_mutation_batches_affecting_query(&query);
        // The subcollection batch is not an immediate child of "rooms".
        assert_eq!(
            for_query.iter().map(|b| b.batch_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn only_the_front_batch_can_be_removed() {
        let queue = MemoryMutationQueue::new();
        let first = add_batch(&queue, &["rooms/a"]);
        let second = add_batch(&queue, &["rooms/b"]);

        queue.remove_mutation_batch(&first);
        assert!(!queue.contains_key(&key("rooms/a")));
        assert!(queue.contains_key(&key("rooms/b")));

        queue.remove_mutation_batch(&second);
        assert!(queue.is_empty());
        queue.perform_consistency_check();
    }
}
