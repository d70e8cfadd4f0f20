pub mod client;
pub mod config;
pub mod core;
pub mod protocol;
pub mod replication;
pub mod server;
pub mod subscription;

// Re-export commonly used types
pub use client::{ClientError, Connection, RemoteEntrySet, RemoteKeySet, RemoteMap, RemoteSubscription};
pub use config::{ServerConfig, StoreConfig};
pub use core::{
    ChangeEvent, HostId, KvStore, MemoryEngine, NodeContext, ReplicationEntry, Result,
    StorageEngine, StoreError, StoreOptions, Version, WalEngine,
};
pub use protocol::{Fault, Request, Response};
pub use replication::{
    ModificationLog, PeerConfig, ReplicationConfig, ReplicationCoordinator, ReplicationStats,
};
pub use server::{StoreRegistry, WireServer};
pub use subscription::{SubscriptionHub, SubscriptionId};
