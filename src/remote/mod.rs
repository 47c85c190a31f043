//! Networking layer: the watch and write streams, their shared reconnect
//! machinery, and the [`RemoteStore`] that coordinates both against the
//! local store and the sync engine.

pub mod connection;
pub mod listen_stream;
pub mod online_state_tracker;
pub mod persistent_stream;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod watch_change;
pub mod watch_change_aggregator;
pub mod write_stream;

pub use connection::{Connection, InMemoryConnection};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::RemoteSyncer;
pub use watch_change_aggregator::TargetMetadataProvider;
