//! Node resources - the participants of a cloudmesh cluster
//!
//! A node is identified by a [`NodeIdentity`]. Each node periodically reports a
//! [`NodeSnapshot`] about itself, and the registry keeps the newest one next to
//! the node's connection state in a [`ClusterNode`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// CPU reading reported by platforms that cannot measure system load
pub const CPU_UNKNOWN: f64 = -1.0;

/// Immutable identity of a cluster participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Unique id of the node
    pub id: String,

    /// Address where the node listens for peers (e.g., "10.0.0.5:4300")
    pub address: String,
}

impl NodeIdentity {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

/// Point-in-time resource metrics of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// Memory used by services on the node, in megabytes
    #[serde(rename = "usedMemoryMb")]
    pub used_memory_mb: u64,

    /// Memory the node may hand out to services, in megabytes
    #[serde(rename = "maxMemoryMb")]
    pub max_memory_mb: u64,

    /// System CPU utilization (0.0 - 100.0), negative when unknown
    #[serde(rename = "systemCpuUsage")]
    pub system_cpu_usage: f64,

    /// When the snapshot was captured
    #[serde(rename = "capturedAt")]
    pub captured_at: DateTime<Utc>,
}

impl NodeSnapshot {
    /// Create a snapshot captured now
    pub fn new(used_memory_mb: u64, max_memory_mb: u64, system_cpu_usage: f64) -> Self {
        Self {
            used_memory_mb,
            max_memory_mb,
            system_cpu_usage,
            captured_at: Utc::now(),
        }
    }

    /// Whether the node reported a usable CPU reading
    pub fn cpu_known(&self) -> bool {
        self.system_cpu_usage >= 0.0
    }

    /// Memory still available for new services
    pub fn free_memory_mb(&self) -> u64 {
        self.max_memory_mb.saturating_sub(self.used_memory_mb)
    }
}

/// A node as seen by the local registry
///
/// Values are never mutated in place once published; the registry swaps in a
/// new `ClusterNode` for every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub identity: NodeIdentity,

    /// Latest snapshot, absent until the first one arrives
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<NodeSnapshot>,

    /// Whether a live connection to the node exists
    pub available: bool,
}

impl ClusterNode {
    /// Create a node that is not connected and has no snapshot yet
    pub fn new(identity: NodeIdentity) -> Self {
        Self {
            identity,
            snapshot: None,
            available: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    /// Copy of this node with a new snapshot
    pub fn with_snapshot(&self, snapshot: NodeSnapshot) -> Self {
        Self {
            identity: self.identity.clone(),
            snapshot: Some(snapshot),
            available: self.available,
        }
    }

    /// Copy of this node with a new availability flag
    pub fn with_available(&self, available: bool) -> Self {
        Self {
            identity: self.identity.clone(),
            snapshot: self.snapshot.clone(),
            available,
        }
    }
}
