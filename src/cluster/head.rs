//! Head node resolution
//!
//! There is no election: the head is derived from the registry every time it
//! is asked for. Among all available nodes, the one with the lexicographically
//! smallest id is the head. When the head disconnects, the next smallest
//! available id takes over on the following decision.

use std::sync::Arc;

use super::node::ClusterNode;
use super::registry::NodeRegistry;

/// Derives the head node from the current registry contents
#[derive(Clone)]
pub struct HeadNodeResolver {
    registry: Arc<NodeRegistry>,
}

impl HeadNodeResolver {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }

    /// The node currently acting as head
    ///
    /// The local node is always available, so this always yields a node.
    pub fn head_node(&self) -> Arc<ClusterNode> {
        head_of(self.registry.nodes()).unwrap_or_else(|| self.registry.self_node())
    }

    /// Whether the local node is the head
    pub fn is_self_head(&self) -> bool {
        self.head_node().id() == self.registry.self_id()
    }
}

/// Pick the head among a set of nodes
pub fn head_of(nodes: impl IntoIterator<Item = Arc<ClusterNode>>) -> Option<Arc<ClusterNode>> {
    nodes
        .into_iter()
        .filter(|n| n.available)
        .min_by(|a, b| a.id().cmp(b.id()))
}
