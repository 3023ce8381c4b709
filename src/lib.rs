//! cloudmesh - service placement for a cluster of cooperating nodes
//!
//! Each node runs the same stack: a [`messaging::Messenger`] over a
//! [`messaging::Transport`], a [`cluster::NodeRegistry`] holding its view of the
//! cluster, and a [`cluster::ServiceOrchestrator`] that routes service creation
//! through the head node.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod messaging;
pub mod service;
