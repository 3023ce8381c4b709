//! Node configuration
//!
//! A node is configured from a YAML file:
//!
//! ```yaml
//! node:
//!   id: node-a
//!   listen: 0.0.0.0:4300
//!   advertise: 10.0.0.1:4300
//! peers:
//!   - id: node-b
//!     address: 10.0.0.2:4300
//! query_timeout_secs: 5
//! snapshot_interval_secs: 10
//! max_service_memory_mb: 8192
//! ```
//!
//! Every field is optional; a missing `node.id` falls back to the host name.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::{NodeIdentity, CLUSTER_PORT};

/// Default query timeout in seconds
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 5;

/// Default snapshot interval in seconds
pub const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 10;

/// Default config file location: ~/.cloudmesh/node.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cloudmesh")
        .join("node.yaml")
}

/// Errors that can occur while loading node configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Validation(String),

    #[error("Failed to write config: {0}")]
    Write(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The local node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSection {
    /// Unique node id; defaults to the host name
    #[serde(default = "default_node_id")]
    pub id: String,

    /// Address to accept cluster connections on
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Address peers should use to reach us, when it differs from `listen`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise: Option<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            listen: default_listen(),
            advertise: None,
        }
    }
}

/// A peer to connect to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub address: String,
}

/// Configuration of one cluster node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,

    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,

    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,

    /// Memory budget for services; defaults to the machine's total memory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_service_memory_mb: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSection::default(),
            peers: vec![],
            query_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            snapshot_interval_secs: DEFAULT_SNAPSHOT_INTERVAL_SECS,
            max_service_memory_mb: None,
        }
    }
}

impl NodeConfig {
    /// Identity this node announces to its peers
    pub fn identity(&self) -> NodeIdentity {
        let address = self
            .node
            .advertise
            .clone()
            .unwrap_or_else(|| self.node.listen.clone());
        NodeIdentity::new(self.node.id.clone(), address)
    }

    pub fn peer_identities(&self) -> Vec<NodeIdentity> {
        self.peers
            .iter()
            .map(|p| NodeIdentity::new(p.id.clone(), p.address.clone()))
            .collect()
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }
}

fn default_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_listen() -> String {
    format!("0.0.0.0:{}", CLUSTER_PORT)
}

fn default_query_timeout_secs() -> u64 {
    DEFAULT_QUERY_TIMEOUT_SECS
}

fn default_snapshot_interval_secs() -> u64 {
    DEFAULT_SNAPSHOT_INTERVAL_SECS
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parse and validate a node config from YAML
pub fn parse_node_config(content: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig =
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_node_config(&config)?;
    Ok(config)
}

/// Serialize a node config to YAML
pub fn serialize_node_config(config: &NodeConfig) -> Result<String, ConfigError> {
    serde_yaml::to_string(config).map_err(|e| ConfigError::Write(e.to_string()))
}

/// Check a node config for mistakes that would break the cluster
pub fn validate_node_config(config: &NodeConfig) -> Result<(), ConfigError> {
    if config.node.id.trim().is_empty() {
        return Err(ConfigError::Validation("node.id must not be empty".to_string()));
    }
    if config.node.listen.parse::<SocketAddr>().is_err() {
        return Err(ConfigError::Validation(format!(
            "node.listen '{}' is not a socket address",
            config.node.listen
        )));
    }
    if config.query_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "query_timeout_secs must be greater than zero".to_string(),
        ));
    }
    if config.snapshot_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "snapshot_interval_secs must be greater than zero".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for peer in &config.peers {
        if peer.id.trim().is_empty() || peer.address.trim().is_empty() {
            return Err(ConfigError::Validation(
                "peers need both an id and an address".to_string(),
            ));
        }
        if peer.id == config.node.id {
            return Err(ConfigError::Validation(format!(
                "peer '{}' has the same id as this node",
                peer.id
            )));
        }
        if !seen.insert(peer.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "peer '{}' is listed twice",
                peer.id
            )));
        }
    }
    Ok(())
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Load a node config from a file that must exist
pub fn load_node_config(path: &Path) -> Result<NodeConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    parse_node_config(&content)
}

/// Load a node config, falling back to defaults when the file is missing
pub fn load_node_config_or_default(path: &Path) -> Result<NodeConfig, ConfigError> {
    match load_node_config(path) {
        Err(ConfigError::NotFound(_)) => Ok(NodeConfig::default()),
        other => other,
    }
}

/// Write a node config, creating parent directories
pub fn save_node_config(config: &NodeConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serialize_node_config(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
