use crate::model::{
    Document, DocumentKey, DocumentState, FieldPath, MaybeDocument, NoDocument, ObjectValue,
    SnapshotVersion, Timestamp, UnknownDocument,
};
use crate::util::{fail, hard_assert};
use crate::value::{self, Value};

/// The set of field paths a patch writes. Paths not covered by the mask
/// are left untouched on the target document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldMask {
    field_paths: Vec<FieldPath>,
}

impl FieldMask {
    pub fn new(mut field_paths: Vec<FieldPath>) -> Self {
        field_paths.sort();
        field_paths.dedup();
        Self { field_paths }
    }

    pub fn field_paths(&self) -> &[FieldPath] {
        &self.field_paths
    }

    /// Whether the mask writes the given path, directly or through an
    /// ancestor.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.field_paths.iter().any(|mask| mask.is_prefix_of(path))
    }
}

/// Condition the backend checks before applying a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precondition {
    None,
    /// Valid only when document existence matches the flag.
    Exists(bool),
    /// Valid only when the cached document carries exactly this version.
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_valid_for(&self, maybe_doc: Option<&MaybeDocument>) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => {
                *exists == matches!(maybe_doc, Some(MaybeDocument::Document(_)))
            }
            Precondition::UpdateTime(version) => match maybe_doc {
                Some(MaybeDocument::Document(doc)) => doc.version() == *version,
                _ => false,
            },
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }
}

/// A server-computed update to a single field.
#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<Value>),
    ArrayRemove(Vec<Value>),
    /// Operand is an Integer or Double value.
    Increment(Value),
}

impl TransformOperation {
    /// Computes the value the local view should show before the server
    /// result arrives.
    pub fn apply_to_local_view(&self, previous: Option<&Value>, local_write_time: Timestamp) -> Value {
        match self {
            TransformOperation::ServerTimestamp => {
                Value::server_timestamp(local_write_time, previous.cloned())
            }
            TransformOperation::ArrayUnion(elements) => {
                let mut values = coerced_array(previous);
                for element in elements {
                    if !values.iter().any(|existing| value::equals(existing, element)) {
                        values.push(element.clone());
                    }
                }
                Value::Array(values)
            }
            TransformOperation::ArrayRemove(elements) => {
                let mut values = coerced_array(previous);
                values.retain(|existing| !elements.iter().any(|e| value::equals(existing, e)));
                Value::Array(values)
            }
            TransformOperation::Increment(operand) => {
                let base = self
                    .compute_base_value(previous)
                    .unwrap_or(Value::Integer(0));
                match (&base, operand) {
                    (Value::Integer(a), Value::Integer(b)) => Value::Integer(a.saturating_add(*b)),
                    _ => Value::Double(number_as_f64(&base) + number_as_f64(operand)),
                }
            }
        }
    }

    /// Folds the server-provided result into the document. Array transforms
    /// receive no server result and recompute locally.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&Value>,
        transform_result: Option<&Value>,
    ) -> Value {
        match self {
            TransformOperation::ServerTimestamp | TransformOperation::Increment(_) => {
                match transform_result {
                    Some(result) => result.clone(),
                    None => fail("transform result missing for acknowledged transform"),
                }
            }
            TransformOperation::ArrayUnion(_) | TransformOperation::ArrayRemove(_) => {
                // Reuse the local computation; the write time is irrelevant
                // for array transforms.
                self.apply_to_local_view(previous, Timestamp::new(0, 0))
            }
        }
    }

    /// The prior value a non-idempotent transform must be replayed against.
    /// Only numeric increments need one.
    pub fn compute_base_value(&self, previous: Option<&Value>) -> Option<Value> {
        match self {
            TransformOperation::Increment(_) => match previous {
                Some(value @ (Value::Integer(_) | Value::Double(_))) => Some(value.clone()),
                _ => Some(Value::Integer(0)),
            },
            _ => None,
        }
    }
}

fn coerced_array(previous: Option<&Value>) -> Vec<Value> {
    match previous {
        Some(Value::Array(values)) => values.clone(),
        _ => Vec::new(),
    }
}

fn number_as_f64(value: &Value) -> f64 {
    match value {
        Value::Integer(n) => *n as f64,
        Value::Double(n) => *n,
        _ => fail("increment operates on numeric values only"),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    pub field: FieldPath,
    pub transform: TransformOperation,
}

/// The backend's answer for one mutation of an acknowledged batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Option<Vec<Value>>,
}

/// A single pending write.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    /// Replaces the document contents entirely.
    Set {
        key: DocumentKey,
        value: ObjectValue,
        precondition: Precondition,
    },
    /// Writes the masked field paths, deleting paths absent from the data.
    Patch {
        key: DocumentKey,
        data: ObjectValue,
        mask: FieldMask,
        precondition: Precondition,
    },
    /// Applies server-computed field updates. Requires the document to
    /// exist, so a set or patch always precedes it in a batch.
    Transform {
        key: DocumentKey,
        field_transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    /// Asks the backend to check the precondition without writing.
    /// Never materializes a document, so applying it to either view is a
    /// programming error.
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Transform { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => *precondition,
            Mutation::Transform { .. } => Precondition::Exists(true),
        }
    }

    /// Applies an acknowledged mutation. The backend accepted it, so a
    /// failed precondition here only means our cached copy was stale.
    pub fn apply_to_remote_document(
        &self,
        maybe_doc: Option<&MaybeDocument>,
        result: &MutationResult,
    ) -> MaybeDocument {
        self.verify_key_matches(maybe_doc);
        match self {
            Mutation::Set { key, value, .. } => Document::new(
                key.clone(),
                result.version,
                value.clone(),
                DocumentState::CommittedMutations,
            )
            .into(),
            Mutation::Patch { key, .. } => {
                if !self.precondition().is_valid_for(maybe_doc) {
                    // The precondition held on the backend, so our cache
                    // is missing the version it was checked against.
                    return UnknownDocument::new(key.clone(), result.version).into();
                }
                let data = self.patch_document(maybe_doc);
                Document::new(
                    key.clone(),
                    result.version,
                    data,
                    DocumentState::CommittedMutations,
                )
                .into()
            }
            Mutation::Transform {
                key,
                field_transforms,
            } => {
                let Some(transform_results) = result.transform_results.as_ref() else {
                    fail("acknowledged transform carried no transform results")
                };
                if !self.precondition().is_valid_for(maybe_doc) {
                    return UnknownDocument::new(key.clone(), result.version).into();
                }
                let doc = require_document(maybe_doc);
                let results =
                    server_transform_results(field_transforms, doc, transform_results);
                let data = transform_object(doc.data().clone(), field_transforms, results);
                Document::new(
                    key.clone(),
                    result.version,
                    data,
                    DocumentState::CommittedMutations,
                )
                .into()
            }
            Mutation::Delete { key, .. } => {
                // Keep the tombstone at the commit version so older watch
                // versions of the document are discarded.
                NoDocument::new(key.clone(), result.version, true).into()
            }
            Mutation::Verify { .. } => fail("a verify mutation is never applied to a document"),
        }
    }

    /// Applies a pending mutation to the local view. `base_doc` is the
    /// document as it was before this batch, used when a preceding patch in
    /// the batch cleared a field a transform still needs.
    pub fn apply_to_local_view(
        &self,
        maybe_doc: Option<MaybeDocument>,
        base_doc: Option<&MaybeDocument>,
        local_write_time: Timestamp,
    ) -> Option<MaybeDocument> {
        self.verify_key_matches(maybe_doc.as_ref());
        if !self.precondition().is_valid_for(maybe_doc.as_ref()) {
            return maybe_doc;
        }
        match self {
            Mutation::Set { key, value, .. } => {
                let version = post_mutation_version(maybe_doc.as_ref());
                Some(
                    Document::new(
                        key.clone(),
                        version,
                        value.clone(),
                        DocumentState::LocalMutations,
                    )
                    .into(),
                )
            }
            Mutation::Patch { key, .. } => {
                let version = post_mutation_version(maybe_doc.as_ref());
                let data = self.patch_document(maybe_doc.as_ref());
                Some(
                    Document::new(key.clone(), version, data, DocumentState::LocalMutations)
                        .into(),
                )
            }
            Mutation::Transform {
                key,
                field_transforms,
            } => {
                let doc = require_document(maybe_doc.as_ref());
                let results = local_transform_results(
                    field_transforms,
                    local_write_time,
                    maybe_doc.as_ref(),
                    base_doc,
                );
                let data = transform_object(doc.data().clone(), field_transforms, results);
                Some(
                    Document::new(
                        key.clone(),
                        doc.version(),
                        data,
                        DocumentState::LocalMutations,
                    )
                    .into(),
                )
            }
            Mutation::Delete { key, .. } => {
                // Deletes have no local version until the server assigns one.
                Some(NoDocument::new(key.clone(), SnapshotVersion::min(), false).into())
            }
            Mutation::Verify { .. } => fail("a verify mutation is never applied to a document"),
        }
    }

    /// Captures the baseline an increment replays against, so repeated
    /// local application stays idempotent.
    pub fn extract_base_value(&self, maybe_doc: Option<&MaybeDocument>) -> Option<ObjectValue> {
        let Mutation::Transform {
            field_transforms, ..
        } = self
        else {
            return None;
        };
        let mut base: Option<ObjectValue> = None;
        for field_transform in field_transforms {
            let existing = maybe_doc
                .and_then(|doc| doc.as_document())
                .and_then(|doc| doc.field(&field_transform.field));
            if let Some(coerced) = field_transform.transform.compute_base_value(existing) {
                base.get_or_insert_with(ObjectValue::empty)
                    .set(&field_transform.field, coerced);
            }
        }
        base
    }

    fn patch_document(&self, maybe_doc: Option<&MaybeDocument>) -> ObjectValue {
        let Mutation::Patch { data, mask, .. } = self else {
            fail("patch_document called on a non-patch mutation")
        };
        let mut patched = match maybe_doc.and_then(|doc| doc.as_document()) {
            Some(doc) => doc.data().clone(),
            None => ObjectValue::empty(),
        };
        for path in mask.field_paths() {
            match data.field(path) {
                Some(value) => patched.set(path, value.clone()),
                None => patched.delete(path),
            }
        }
        patched
    }

    fn verify_key_matches(&self, maybe_doc: Option<&MaybeDocument>) {
        if let Some(doc) = maybe_doc {
            hard_assert(
                doc.key() == self.key(),
                "a mutation can only be applied to its own document",
            );
        }
    }
}

fn post_mutation_version(maybe_doc: Option<&MaybeDocument>) -> SnapshotVersion {
    match maybe_doc {
        Some(MaybeDocument::Document(doc)) => doc.version(),
        _ => SnapshotVersion::min(),
    }
}

fn require_document<'a>(maybe_doc: Option<&'a MaybeDocument>) -> &'a Document {
    match maybe_doc {
        Some(MaybeDocument::Document(doc)) => doc,
        _ => fail("transforms can only be applied to an existing document"),
    }
}

fn server_transform_results(
    field_transforms: &[FieldTransform],
    doc: &Document,
    transform_results: &[Value],
) -> Vec<Value> {
    hard_assert(
        transform_results.len() == field_transforms.len(),
        "server transform result count must match the field transforms",
    );
    field_transforms
        .iter()
        .zip(transform_results)
        .map(|(field_transform, result)| {
            let previous = doc.field(&field_transform.field);
            field_transform
                .transform
                .apply_to_remote_document(previous, Some(result))
        })
        .collect()
}

fn local_transform_results(
    field_transforms: &[FieldTransform],
    local_write_time: Timestamp,
    maybe_doc: Option<&MaybeDocument>,
    base_doc: Option<&MaybeDocument>,
) -> Vec<Value> {
    field_transforms
        .iter()
        .map(|field_transform| {
            let mut previous = maybe_doc
                .and_then(|doc| doc.as_document())
                .and_then(|doc| doc.field(&field_transform.field));
            if previous.is_none() {
                // Fall back to the pre-batch state when an earlier mutation
                // in the batch cleared the field.
                previous = base_doc
                    .and_then(|doc| doc.as_document())
                    .and_then(|doc| doc.field(&field_transform.field));
            }
            field_transform
                .transform
                .apply_to_local_view(previous, local_write_time)
        })
        .collect()
}

fn transform_object(
    mut data: ObjectValue,
    field_transforms: &[FieldTransform],
    results: Vec<Value>,
) -> ObjectValue {
    hard_assert(
        results.len() == field_transforms.len(),
        "transform result count must match the field transforms",
    );
    for (field_transform, result) in field_transforms.iter().zip(results) {
        data.set(&field_transform.field, result);
    }
    data
}
