use crate::core::events::{HostId, ReplicationEntry};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Messages exchanged between peers. Each direction of a peer connection is
/// one replication session: the dialing side announces itself with `Hello`
/// and then consumes the remote node's modification stream, acknowledging
/// applied offsets so the remote side can resume it after a reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerMessage {
    /// First message on a connection, sent by the dialing side. Each
    /// connection replicates one store; `resume_from` is the next log
    /// offset wanted from this peer, or None to request a full bootstrap.
    Hello {
        host_id: HostId,
        store: String,
        resume_from: Option<u64>,
    },
    /// One record of a bootstrap snapshot. Carries no log offset; the
    /// receiver's cursor only moves once the snapshot completes.
    SnapshotEntry { entry: ReplicationEntry },
    /// End of a bootstrap snapshot. The snapshot covers all data up to
    /// `data_up_to_ms`; live entries follow from `resume_offset`.
    BatchComplete {
        data_up_to_ms: u64,
        resume_offset: u64,
    },
    /// One live modification at its position in the sender's log.
    Entry { offset: u64, entry: ReplicationEntry },
    /// Receiver has applied everything before `next_wanted`.
    Ack { next_wanted: u64 },
    /// Keepalive carrying the sender's current log position.
    Heartbeat { offset: u64, timestamp_ms: u64 },
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    /// The requested offset was evicted from the modification log; the peer
    /// must be re-seeded with a full snapshot.
    #[error("requested offset no longer buffered, bootstrap required")]
    BootstrapRequired,

    #[error("connection to peer failed: {0}")]
    ConnectionFailed(String),

    #[error("replication handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store error: {0}")]
    Store(#[from] crate::core::error::StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<crate::protocol::FrameError> for ReplicationError {
    fn from(e: crate::protocol::FrameError) -> Self {
        match e {
            crate::protocol::FrameError::Io(e) => ReplicationError::Io(e),
            crate::protocol::FrameError::Serialization(s) => ReplicationError::Serialization(s),
            other => ReplicationError::ConnectionFailed(other.to_string()),
        }
    }
}

impl From<bincode::Error> for ReplicationError {
    fn from(e: bincode::Error) -> Self {
        ReplicationError::Serialization(e.to_string())
    }
}

pub type ReplicationResult<T> = std::result::Result<T, ReplicationError>;

/// Counters exposed by the coordinator, for logs and operators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationStats {
    pub entries_sent: u64,
    pub entries_applied: u64,
    pub entries_discarded: u64,
    pub bootstraps_served: u64,
    pub connected_peers: usize,
    pub log_offset: u64,
}
