use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::replication::ReplicationConfig;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: Server,
    #[serde(default)]
    pub stores: Vec<StoreConfig>,
    #[serde(default)]
    pub replication: ReplicationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

/// One store served by this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub name: String,
    /// Backing engine kind ("memory" or "wal").
    #[serde(default = "default_engine")]
    pub engine: String,
    pub data_dir: Option<PathBuf>,
    /// Whether this store joins the replication mesh.
    #[serde(default)]
    pub replicated: bool,
}

fn default_engine() -> String {
    "memory".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: Server {
                host: "0.0.0.0".to_string(),
                port: 16400,
            },
            stores: vec![StoreConfig {
                name: "default".to_string(),
                engine: default_engine(),
                data_dir: None,
                replicated: false,
            }],
            replication: ReplicationConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl ServerConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: ServerConfig = serde_yaml::from_str(&content)?;
        config
            .replication
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid replication config: {e}"))?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
