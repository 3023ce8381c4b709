//! Placement - picking the node that should host a new service
//!
//! Greedy least-loaded placement. Candidates are ranked by the memory they
//! would use after taking the new service; CPU usage only breaks ties, and
//! only when every tied candidate reports a CPU reading. The ranking is
//! recomputed from the live registry on every request.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use super::node::{ClusterNode, NodeSnapshot};
use super::registry::NodeRegistry;
use crate::service::ServiceResourceRequest;

/// Selects target nodes for new services
#[derive(Clone)]
pub struct PlacementPlanner {
    registry: Arc<NodeRegistry>,
}

impl PlacementPlanner {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }

    /// Select the best node for a service, or `None` if no node qualifies
    pub fn select_target(&self, request: &ServiceResourceRequest) -> Option<Arc<ClusterNode>> {
        let target = select_from(self.registry.nodes(), request);
        if let Some(node) = &target {
            debug!(
                "Selected node {} for a service requesting {} MB",
                node.id(),
                request.memory_mb
            );
        }
        target
    }
}

/// Memory a node would use after accepting the request
pub fn projected_memory(snapshot: &NodeSnapshot, request: &ServiceResourceRequest) -> u64 {
    snapshot.used_memory_mb.saturating_add(request.memory_mb)
}

/// Compare two candidates; `Ordering::Less` means `a` is preferred
///
/// CPU usage is only consulted when the projected memory is equal and both
/// nodes report a CPU reading.
pub fn compare_candidates(
    a: &NodeSnapshot,
    b: &NodeSnapshot,
    request: &ServiceResourceRequest,
) -> Ordering {
    let by_memory = projected_memory(a, request).cmp(&projected_memory(b, request));
    if by_memory != Ordering::Equal || !(a.cpu_known() && b.cpu_known()) {
        return by_memory;
    }
    a.system_cpu_usage
        .partial_cmp(&b.system_cpu_usage)
        .unwrap_or(Ordering::Equal)
}

/// Select the preferred node out of `nodes`
///
/// Only available nodes that have reported a snapshot are candidates. Among
/// candidates tied on memory, the first one in iteration order wins unless all
/// of them report CPU usage.
pub fn select_from(
    nodes: impl IntoIterator<Item = Arc<ClusterNode>>,
    request: &ServiceResourceRequest,
) -> Option<Arc<ClusterNode>> {
    let candidates: Vec<(Arc<ClusterNode>, NodeSnapshot)> = nodes
        .into_iter()
        .filter(|n| n.available)
        .filter_map(|n| n.snapshot.clone().map(|s| (n, s)))
        .collect();

    let lowest = candidates
        .iter()
        .map(|(_, snapshot)| projected_memory(snapshot, request))
        .min()?;

    let tied: Vec<&(Arc<ClusterNode>, NodeSnapshot)> = candidates
        .iter()
        .filter(|(_, snapshot)| projected_memory(snapshot, request) == lowest)
        .collect();

    if tied.iter().all(|(_, snapshot)| snapshot.cpu_known()) {
        tied.into_iter()
            .min_by(|(_, a), (_, b)| compare_candidates(a, b, request))
            .map(|(node, _)| node.clone())
    } else {
        tied.first().map(|(node, _)| node.clone())
    }
}
