/// Replication module - symmetric peer-to-peer convergence
///
/// Every node both serves its own modification log and pulls every peer's.
/// Convergence model:
/// - Last-write-wins on (timestamp, origin) per key, tombstones included
/// - Applied entries are never re-logged, so nothing loops through the mesh
/// - Entries originating at a node are skipped when streaming back to it
///
/// Features:
/// - Full bootstrap on first connect (snapshot + BatchComplete boundary)
/// - Partial resume on reconnect (from last acked offset)
/// - Per-peer cursors advanced by acks
pub mod config;
pub mod coordinator;
pub mod log;
pub mod types;

pub use config::{PeerConfig, ReplicationConfig};
pub use coordinator::ReplicationCoordinator;
pub use log::{LogRecord, ModificationLog};
pub use types::{PeerMessage, ReplicationError, ReplicationResult, ReplicationStats};

#[cfg(test)]
mod tests;
