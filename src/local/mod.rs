pub mod listen_sequence;
pub mod local_documents_view;
pub mod local_store;
pub mod local_view_changes;
pub mod lru_garbage_collector;
pub mod memory_persistence;
pub mod mutation_queue;
pub mod persistence;
pub mod query_engine;
pub mod reference_set;
pub mod remote_document_cache;
pub mod target_cache;
pub mod target_data;
pub mod target_id_generator;

pub use listen_sequence::{ListenSequence, ListenSequenceNumber};
pub use local_documents_view::LocalDocumentsView;
pub use local_store::{LocalStore, LocalWriteResult, QueryResult, UserChangeResult};
pub use local_view_changes::LocalViewChanges;
pub use lru_garbage_collector::{LruGarbageCollector, LruParams, LruResults, LruScheduler};
pub use memory_persistence::{MemoryEagerDelegate, MemoryLruDelegate, MemoryPersistence};
pub use mutation_queue::MemoryMutationQueue;
pub use persistence::{LruDelegate, PersistenceTransaction, ReferenceDelegate};
pub use query_engine::QueryEngine;
pub use reference_set::ReferenceSet;
pub use remote_document_cache::MemoryRemoteDocumentCache;
pub use target_cache::MemoryTargetCache;
pub use target_data::{QueryPurpose, TargetData};
pub use target_id_generator::TargetIdGenerator;
