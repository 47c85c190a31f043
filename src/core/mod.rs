pub mod client;
pub mod event_manager;
pub mod sync_engine;
pub mod types;
pub mod view;
pub mod view_snapshot;

pub use client::{GarbageCollectionPolicy, ListenerRegistration, SyncClient, SyncClientConfig};
pub use event_manager::{EventManager, ListenOptions};
pub use sync_engine::{SyncEngine, SyncEngineListener};
pub use types::OnlineState;
pub use view_snapshot::ViewSnapshot;
