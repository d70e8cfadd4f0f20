use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Node identifier within a replicated cluster, assigned at configuration
/// time. Doubles as the deterministic tie-break for equal timestamps.
pub type HostId = u8;

/// Change event emitted for every locally-applied mutation, whether the
/// mutation originated locally or via replication apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeEvent {
    Inserted {
        key: String,
        value: Vec<u8>,
    },
    Updated {
        key: String,
        old_value: Vec<u8>,
        new_value: Vec<u8>,
    },
    Removed {
        key: String,
        old_value: Vec<u8>,
    },
    /// End of a batch of bootstrap messages. Carries no key; only delivered
    /// to subscribers that opted into bootstrap-boundary notification.
    BatchComplete { data_up_to_ms: u64 },
}

impl ChangeEvent {
    /// Key this event refers to, if any (BatchComplete has none).
    pub fn key(&self) -> Option<&str> {
        match self {
            ChangeEvent::Inserted { key, .. }
            | ChangeEvent::Updated { key, .. }
            | ChangeEvent::Removed { key, .. } => Some(key),
            ChangeEvent::BatchComplete { .. } => None,
        }
    }

    /// Value after the mutation, if any.
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            ChangeEvent::Inserted { value, .. } => Some(value),
            ChangeEvent::Updated { new_value, .. } => Some(new_value),
            _ => None,
        }
    }

    pub fn is_batch_complete(&self) -> bool {
        matches!(self, ChangeEvent::BatchComplete { .. })
    }
}

/// Per-key version used for last-write-wins conflict resolution. Ordering is
/// lexicographic on (timestamp, origin): the higher pair wins, so equal
/// timestamps break ties by origin id on every replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub timestamp_ms: u64,
    pub origin: HostId,
}

/// The unit shipped between peers: one mutation with enough metadata to
/// apply it idempotently anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationEntry {
    pub key: String,
    /// None is a tombstone.
    pub value: Option<Vec<u8>>,
    pub timestamp_ms: u64,
    pub origin: HostId,
    pub is_deleted: bool,
}

impl ReplicationEntry {
    pub fn put(key: String, value: Vec<u8>, timestamp_ms: u64, origin: HostId) -> Self {
        Self {
            key,
            value: Some(value),
            timestamp_ms,
            origin,
            is_deleted: false,
        }
    }

    pub fn tombstone(key: String, timestamp_ms: u64, origin: HostId) -> Self {
        Self {
            key,
            value: None,
            timestamp_ms,
            origin,
            is_deleted: true,
        }
    }

    pub fn version(&self) -> Version {
        Version {
            timestamp_ms: self.timestamp_ms,
            origin: self.origin,
        }
    }

    /// Last-write-wins comparison against the version recorded for this key.
    /// Equal versions lose, which makes duplicate delivery a no-op.
    pub fn wins_over(&self, recorded: Option<Version>) -> bool {
        match recorded {
            Some(v) => self.version() > v,
            None => true,
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
