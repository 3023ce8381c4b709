//! Node registry - the local view of cluster membership
//!
//! The registry owns every [`ClusterNode`] known to this node, including the
//! node itself. Changes never touch a published value: each update builds a new
//! `ClusterNode` and swaps the `Arc` under the map's shard lock, so concurrent
//! readers observe either the old or the new node, never a mix of both.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::node::{ClusterNode, NodeIdentity, NodeSnapshot};

/// Errors returned by registry operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Node '{0}' not found")]
    UnknownNode(String),

    #[error("Node '{0}' already registered")]
    NodeExists(String),

    #[error("Operation not permitted on the local node '{0}'")]
    SelfNode(String),
}

struct PeerEntry {
    /// Registration sequence, used for stable iteration order
    seq: u64,
    node: Arc<ClusterNode>,
}

/// Registry of cluster nodes
pub struct NodeRegistry {
    self_id: String,
    local: RwLock<Arc<ClusterNode>>,
    peers: DashMap<String, PeerEntry>,
    next_seq: AtomicU64,
}

impl NodeRegistry {
    /// Create a registry whose only member is the local node
    pub fn new(local: NodeIdentity) -> Self {
        let self_id = local.id.clone();
        let node = ClusterNode::new(local).with_available(true);

        Self {
            self_id,
            local: RwLock::new(Arc::new(node)),
            peers: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Id of the local node
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// The local node; always present and always available
    pub fn self_node(&self) -> Arc<ClusterNode> {
        self.local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_self(&self, id: &str) -> bool {
        id == self.self_id
    }

    /// Register a newly discovered peer
    ///
    /// Peers start out unavailable until the transport reports a connection.
    pub fn register(&self, identity: NodeIdentity) -> Result<Arc<ClusterNode>, RegistryError> {
        if self.is_self(&identity.id) {
            return Err(RegistryError::NodeExists(identity.id));
        }

        match self.peers.entry(identity.id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::NodeExists(identity.id)),
            Entry::Vacant(slot) => {
                let node = Arc::new(ClusterNode::new(identity));
                slot.insert(PeerEntry {
                    seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                    node: node.clone(),
                });
                info!("Registered cluster node {}", node.id());
                Ok(node)
            }
        }
    }

    /// Remove a decommissioned peer
    pub fn unregister(&self, id: &str) -> Result<Arc<ClusterNode>, RegistryError> {
        if self.is_self(id) {
            return Err(RegistryError::SelfNode(id.to_string()));
        }

        self.peers
            .remove(id)
            .map(|(_, entry)| entry.node)
            .ok_or_else(|| RegistryError::UnknownNode(id.to_string()))
    }

    /// All nodes in registration order, the local node first
    pub fn nodes(&self) -> Vec<Arc<ClusterNode>> {
        let mut peers: Vec<(u64, Arc<ClusterNode>)> = self
            .peers
            .iter()
            .map(|entry| (entry.seq, entry.node.clone()))
            .collect();
        peers.sort_by_key(|(seq, _)| *seq);

        let mut nodes = Vec::with_capacity(peers.len() + 1);
        nodes.push(self.self_node());
        nodes.extend(peers.into_iter().map(|(_, node)| node));
        nodes
    }

    /// Nodes that are currently available, in registration order
    pub fn available_nodes(&self) -> Vec<Arc<ClusterNode>> {
        self.nodes().into_iter().filter(|n| n.available).collect()
    }

    /// Look up a node by id
    pub fn node(&self, id: &str) -> Option<Arc<ClusterNode>> {
        if self.is_self(id) {
            return Some(self.self_node());
        }
        self.peers.get(id).map(|entry| entry.node.clone())
    }

    /// Number of known nodes, including the local one
    pub fn len(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Replace the snapshot of a node
    ///
    /// Snapshots captured before the stored one are ignored.
    pub fn update_snapshot(&self, id: &str, snapshot: NodeSnapshot) -> Result<(), RegistryError> {
        if self.is_self(id) {
            let mut local = self.local.write().unwrap_or_else(PoisonError::into_inner);
            if !is_newer(&local, &snapshot) {
                return Ok(());
            }
            *local = Arc::new(local.with_snapshot(snapshot));
            return Ok(());
        }

        let Some(mut entry) = self.peers.get_mut(id) else {
            warn!("Dropping snapshot for unknown node {}", id);
            return Err(RegistryError::UnknownNode(id.to_string()));
        };

        if !is_newer(&entry.node, &snapshot) {
            debug!("Ignoring stale snapshot for node {}", id);
            return Ok(());
        }
        entry.node = Arc::new(entry.node.with_snapshot(snapshot));
        Ok(())
    }

    /// Flip the connection state of a peer
    ///
    /// The local node is always available; requests to change it are ignored.
    pub fn mark_connected(&self, id: &str, connected: bool) -> Result<(), RegistryError> {
        if self.is_self(id) {
            if !connected {
                warn!("Ignoring request to mark the local node {} unavailable", id);
            }
            return Ok(());
        }

        let Some(mut entry) = self.peers.get_mut(id) else {
            warn!("Connection state change for unknown node {}", id);
            return Err(RegistryError::UnknownNode(id.to_string()));
        };

        if entry.node.available != connected {
            info!(
                "Node {} is now {}",
                id,
                if connected { "connected" } else { "disconnected" }
            );
            entry.node = Arc::new(entry.node.with_available(connected));
        }
        Ok(())
    }
}

fn is_newer(node: &ClusterNode, snapshot: &NodeSnapshot) -> bool {
    node.snapshot
        .as_ref()
        .map(|current| snapshot.captured_at >= current.captured_at)
        .unwrap_or(true)
}
