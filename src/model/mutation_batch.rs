use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

use crate::model::{DocumentKey, MaybeDocument, Mutation, MutationResult, SnapshotVersion, Timestamp};
use crate::util::hard_assert;

/// Batch id carried by documents whose pending batch is not known.
pub const BATCH_ID_UNKNOWN: i32 = -1;

/// All mutations from one user commit, applied atomically.
///
/// `base_mutations` pin the pre-batch values that non-idempotent transforms
/// replay against; they are applied locally before the real mutations and
/// are never sent to the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: i32,
    pub local_write_time: Timestamp,
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: i32,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    /// Folds the acknowledged batch into the given document.
    pub fn apply_to_remote_document(
        &self,
        doc_key: &DocumentKey,
        mut maybe_doc: Option<MaybeDocument>,
        batch_result: &MutationBatchResult,
    ) -> Option<MaybeDocument> {
        let results = &batch_result.mutation_results;
        hard_assert(
            results.len() == self.mutations.len(),
            "mutation batch result size must match the batch",
        );
        for (mutation, result) in self.mutations.iter().zip(results) {
            if mutation.key() == doc_key {
                maybe_doc = Some(mutation.apply_to_remote_document(maybe_doc.as_ref(), result));
            }
        }
        maybe_doc
    }

    /// Computes the local view of the given document under this batch.
    pub fn apply_to_local_view(
        &self,
        doc_key: &DocumentKey,
        mut maybe_doc: Option<MaybeDocument>,
    ) -> Option<MaybeDocument> {
        // Base state first, so transforms see a consistent baseline no
        // matter how often the batch is replayed.
        for mutation in &self.base_mutations {
            if mutation.key() == doc_key {
                maybe_doc = mutation.apply_to_local_view(
                    maybe_doc,
                    None,
                    self.local_write_time,
                );
            }
        }
        let base_doc = maybe_doc.clone();
        for mutation in &self.mutations {
            if mutation.key() == doc_key {
                maybe_doc = mutation.apply_to_local_view(
                    maybe_doc,
                    base_doc.as_ref(),
                    self.local_write_time,
                );
            }
        }
        maybe_doc
    }

    /// Applies the batch to every document it touches in the given set.
    pub fn apply_to_local_document_set(&self, docs: &mut BTreeMap<DocumentKey, MaybeDocument>) {
        for mutation in &self.mutations {
            let doc_key = mutation.key();
            let before = docs.get(doc_key).cloned();
            if let Some(after) = self.apply_to_local_view(doc_key, before) {
                docs.insert(doc_key.clone(), after);
            }
        }
    }
}

/// An acknowledged batch together with the per-document versions the
/// acknowledgement assigned.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Bytes,
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn new(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Bytes,
    ) -> Self {
        hard_assert(
            batch.mutations.len() == mutation_results.len(),
            "mutations and mutation results must pair up",
        );
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Document, DocumentState, FieldMask, FieldPath, FieldTransform, ObjectValue, Precondition,
        TransformOperation,
    };
    use crate::value::Value;
    use serde_json::json;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn counter_doc(count: i64) -> MaybeDocument {
        Document::new(
            key("counters/a"),
            version(1),
            ObjectValue::from_json(json!({ "count": count })).unwrap(),
            DocumentState::Synced,
        )
        .into()
    }

    fn increment_batch(batch_id: i32, baseline: i64) -> MutationBatch {
        let base = Mutation::Patch {
            key: key("counters/a"),
            data: ObjectValue::from_json(json!({ "count": baseline })).unwrap(),
            mask: FieldMask::new(vec![field("count")]),
            precondition: Precondition::Exists(true),
        };
        let transform = Mutation::Transform {
            key: key("counters/a"),
            field_transforms: vec![FieldTransform {
                field: field("count"),
                transform: TransformOperation::Increment(Value::Integer(1)),
            }],
        };
        MutationBatch::new(batch_id, Timestamp::new(10, 0), vec![base], vec![transform])
    }

    #[test]
    fn base_mutations_pin_the_transform_baseline() {
        let batch = increment_batch(1, 41);
        // The cached document has moved past the captured baseline; the
        // replayed batch must still produce baseline + 1.
        let after = batch
            .apply_to_local_view(&key("counters/a"), Some(counter_doc(55)))
            .unwrap();
        let after = after.as_document().unwrap();
        assert_eq!(after.field(&field("count")), Some(&Value::Integer(42)));
        assert!(after.has_local_mutations());
    }

    #[test]
    fn batch_only_touches_its_own_documents() {
        let batch = increment_batch(1, 0);
        let other = Document::new(
            key("counters/b"),
            version(1),
            ObjectValue::from_json(json!({ "count": 9 })).unwrap(),
            DocumentState::Synced,
        );
        let mut docs: BTreeMap<DocumentKey, MaybeDocument> = BTreeMap::new();
        docs.insert(key("counters/b"), other.clone().into());
        batch.apply_to_local_document_set(&mut docs);
        assert_eq!(docs.get(&key("counters/b")), Some(&other.clone().into()));
    }

    #[test]
    fn batch_result_records_per_document_versions() {
        let batch = MutationBatch::new(
            3,
            Timestamp::new(10, 0),
            vec![],
            vec![
                Mutation::Set {
                    key: key("rooms/a"),
                    value: ObjectValue::empty(),
                    precondition: Precondition::None,
                },
                Mutation::Set {
                    key: key("rooms/b"),
                    value: ObjectValue::empty(),
                    precondition: Precondition::None,
                },
            ],
        );
        let result = MutationBatchResult::new(
            batch,
            version(9),
            vec![
                MutationResult {
                    version: version(7),
                    transform_results: None,
                },
                MutationResult {
                    version: version(8),
                    transform_results: None,
                },
            ],
            Bytes::from_static(b"token"),
        );
        assert_eq!(result.doc_versions.get(&key("rooms/a")), Some(&version(7)));
        assert_eq!(result.doc_versions.get(&key("rooms/b")), Some(&version(8)));
    }

    #[test]
    fn keys_cover_every_mutation() {
        let batch = MutationBatch::new(
            1,
            Timestamp::new(0, 0),
            vec![],
            vec![
                Mutation::Delete {
                    key: key("rooms/a"),
                    precondition: Precondition::None,
                },
                Mutation::Delete {
                    key: key("rooms/b"),
                    precondition: Precondition::None,
                },
            ],
        );
        let keys = batch.keys();
        assert!(keys.contains(&key("rooms/a")));
        assert!(keys.contains(&key("rooms/b")));
        assert_eq!(keys.len(), 2);
    }
}
