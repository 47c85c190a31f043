pub mod document;
pub mod document_key;
pub mod document_set;
pub mod field_path;
pub mod mutation;
pub mod mutation_batch;
pub mod object_value;
pub mod resource_path;
pub mod snapshot_version;
pub mod timestamp;

pub use document::{Document, DocumentState, MaybeDocument, NoDocument, UnknownDocument};
pub use document_key::DocumentKey;
pub use document_set::DocumentSet;
pub use field_path::FieldPath;
pub use mutation::{
    FieldMask, Mutation, MutationResult, Precondition, FieldTransform, TransformOperation,
};
pub use mutation_batch::{MutationBatch, MutationBatchResult, BATCH_ID_UNKNOWN};
pub use object_value::ObjectValue;
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;
