//! Client core of an offline-first document store.
//!
//! The crate keeps a local cache of a remote document database in sync with a
//! streaming watch protocol while serving reads and writes from the cache
//! immediately. Writes made while offline queue locally and drain to the
//! backend once connectivity returns; queries stay live through incremental
//! view updates.
//!
//! Layering, bottom up:
//!
//! - [`model`] / [`value`]: document identity, typed field values and their
//!   total order.
//! - [`query`]: filters, orderings, bounds and canonical targets.
//! - [`local`]: the persistence abstraction, mutation queue and
//!   [`local::LocalStore`] producing the latency-compensated local view.
//! - [`remote`]: watch/write stream lifecycle, event aggregation and the
//!   [`remote::RemoteStore`] write pipeline.
//! - [`core`]: per-query views, the [`core::SyncEngine`] coordinator, the
//!   listener-facing [`core::EventManager`] and the [`core::SyncClient`]
//!   facade.
//!
//! Transport, credentials and the durable storage medium are collaborator
//! traits supplied by the embedding application.

pub mod auth;
pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod platform;
pub mod query;
pub mod remote;
pub mod util;
pub mod value;

pub use crate::core::{
    GarbageCollectionPolicy, ListenOptions, ListenerRegistration, SyncClient, SyncClientConfig,
    ViewSnapshot,
};
pub use error::{StoreError, StoreErrorCode, StoreResult};
pub use model::{DocumentKey, MaybeDocument, SnapshotVersion, Timestamp};
pub use value::Value;
