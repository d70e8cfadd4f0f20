//! Storage core: engines, the store facade, change events and the engine
//! registry.

pub mod engine;
pub mod error;
pub mod events;
pub mod registry;
pub mod store;
pub mod wal;

pub use engine::{MemoryEngine, StorageEngine};
pub use error::{Result, StoreError};
pub use events::{ChangeEvent, HostId, ReplicationEntry, Version};
pub use registry::{EngineOptions, NodeContext};
pub use store::{KvStore, StoreOptions};
pub use wal::WalEngine;
