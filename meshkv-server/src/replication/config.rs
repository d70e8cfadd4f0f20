use crate::core::events::HostId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// One remote node in the mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub host_id: HostId,
    pub address: SocketAddr,
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Enable replication
    pub enabled: bool,

    /// This node's identifier, unique across the mesh
    pub host_id: HostId,

    /// Address peers connect to for pulling this node's modifications
    pub listen_address: Option<SocketAddr>,

    /// Remote nodes this node pulls modifications from
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Ack interval in milliseconds (how often applied offsets are reported)
    pub ack_interval_ms: u64,

    /// Automatic reconnect on disconnect
    pub auto_reconnect: bool,

    /// Reconnect delay in milliseconds
    pub reconnect_delay_ms: u64,

    /// Modification log capacity (records buffered per store)
    pub log_capacity: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host_id: 0,
            listen_address: None,
            peers: Vec::new(),
            heartbeat_interval_ms: 1000, // 1 second heartbeat
            ack_interval_ms: 500,
            auto_reconnect: true,
            reconnect_delay_ms: 5000, // 5 seconds
            log_capacity: 65_536,
        }
    }
}

impl ReplicationConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }

        if self.host_id == 0 {
            return Err("Replication requires a non-zero host_id".to_string());
        }
        if self.listen_address.is_none() {
            return Err("Replication requires a listen_address".to_string());
        }
        if self.peers.iter().any(|p| p.host_id == self.host_id) {
            return Err("Peer list must not contain this node's own host_id".to_string());
        }
        let mut ids: Vec<HostId> = self.peers.iter().map(|p| p.host_id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.peers.len() {
            return Err("Duplicate host_id in peer list".to_string());
        }
        if self.log_capacity == 0 {
            return Err("log_capacity must be greater than zero".to_string());
        }

        Ok(())
    }
}
