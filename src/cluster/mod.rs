//! # Cluster Coordination
//!
//! Decides where new cloud services run across a set of cooperating nodes.
//!
//! ## Model
//!
//! Every node keeps its own [`NodeRegistry`]: the nodes it knows about, whether
//! it is currently connected to them, and their last [`NodeSnapshot`]. There is
//! no election. The head is whichever available node has the smallest id, so
//! all nodes with the same view agree on it.
//!
//! ## Creating a service
//!
//! ```text
//!   admin ──► any node ──(node_to_head_start_service)──► head
//!                                                         │ placement
//!                              ┌──────────────────────────┤
//!                              ▼                          ▼
//!                         start locally     (head_node_to_node_start_service)
//!                                                         │
//!                                                         ▼
//!                                                   chosen node
//! ```
//!
//! Placement prefers the node with the lowest memory use after accepting the
//! request, then the lowest CPU usage if every tied node reports one.

pub mod head;
pub mod node;
pub mod orchestrator;
pub mod placement;
pub mod registry;
pub mod runtime;
pub mod snapshot;

pub use head::{head_of, HeadNodeResolver};
pub use node::{ClusterNode, NodeIdentity, NodeSnapshot, CPU_UNKNOWN};
pub use orchestrator::{
    CreateServiceError, FailureReason, Route, ServiceOrchestrator,
    HEAD_NODE_TO_NODE_START_SERVICE, NODE_TO_HEAD_START_SERVICE,
};
pub use placement::{compare_candidates, projected_memory, select_from, PlacementPlanner};
pub use registry::{NodeRegistry, RegistryError};
pub use runtime::ClusterRuntime;
pub use snapshot::{
    spawn_snapshot_publisher, system_memory_mb, SnapshotCollector, SnapshotListener,
    SnapshotPublisher, DEFAULT_SNAPSHOT_INTERVAL, NODE_SNAPSHOT_UPDATE,
};

/// Default port nodes listen on for cluster traffic
pub const CLUSTER_PORT: u16 = 4300;

/// Delay between attempts to reach a configured peer
pub const PEER_RETRY_SECS: u64 = 3;
