//! Resource snapshots
//!
//! Every node periodically samples its own load, stores it in its registry and
//! broadcasts it to all peers on [`NODE_SNAPSHOT_UPDATE`]. Peers apply what
//! they receive to their own registry; placement on the head reads from there.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::System;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::node::{NodeSnapshot, CPU_UNKNOWN};
use super::registry::NodeRegistry;
use crate::messaging::{
    ChannelListener, ChannelMessageEvent, ChannelTarget, Messenger, PRIORITY_NORMAL,
};
use crate::service::SharedServiceManager;

/// Channel snapshots are broadcast on
pub const NODE_SNAPSHOT_UPDATE: &str = "node_snapshot_update";

/// Default interval between two snapshots
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(10);

/// Total memory of this machine in megabytes
pub fn system_memory_mb() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.total_memory() / (1024 * 1024)
}

/// Samples the load of the local node
///
/// Memory figures come from the service manager: what services have reserved
/// against the node's budget. CPU usage is the machine-wide average reported
/// by `sysinfo`, or [`CPU_UNKNOWN`] when the platform has no CPU information.
pub struct SnapshotCollector {
    system: System,
    services: SharedServiceManager,
}

impl SnapshotCollector {
    pub fn new(services: SharedServiceManager) -> Self {
        Self {
            system: System::new(),
            services,
        }
    }

    /// Take a fresh snapshot
    pub fn collect(&mut self) -> NodeSnapshot {
        self.system.refresh_cpu_all();

        let cpu_usage = if self.system.cpus().is_empty() {
            CPU_UNKNOWN
        } else {
            self.system.global_cpu_usage() as f64
        };

        NodeSnapshot::new(
            self.services.reserved_memory_mb(),
            self.services.max_memory_mb(),
            cpu_usage,
        )
    }
}

/// Publishes snapshots of the local node to the cluster
pub struct SnapshotPublisher {
    registry: Arc<NodeRegistry>,
    messenger: Arc<Messenger>,
    collector: SnapshotCollector,
    interval: Duration,
}

impl SnapshotPublisher {
    pub fn new(
        registry: Arc<NodeRegistry>,
        messenger: Arc<Messenger>,
        collector: SnapshotCollector,
    ) -> Self {
        Self {
            registry,
            messenger,
            collector,
            interval: DEFAULT_SNAPSHOT_INTERVAL,
        }
    }

    /// Set the publish interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sample, store and broadcast one snapshot
    ///
    /// Returns the number of peers the snapshot was sent to.
    pub async fn publish_once(&mut self) -> usize {
        let snapshot = self.collector.collect();
        let self_id = self.registry.self_id().to_string();

        if let Err(e) = self.registry.update_snapshot(&self_id, snapshot.clone()) {
            warn!("Failed to store local snapshot: {}", e);
        }

        let content = match serde_json::to_vec(&snapshot) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to encode snapshot: {}", e);
                return 0;
            }
        };
        match self
            .messenger
            .message(NODE_SNAPSHOT_UPDATE, vec![ChannelTarget::all()], content)
        {
            Ok(message) => self.messenger.send(message).await,
            Err(e) => {
                warn!("Failed to build snapshot message: {}", e);
                0
            }
        }
    }

    /// Publish until the shutdown signal fires
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting snapshot publisher: node={}, interval={:?}",
            self.registry.self_id(),
            self.interval
        );

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let peers = self.publish_once().await;
                    debug!("Published snapshot to {} peers", peers);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Snapshot publisher shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Spawn a snapshot publisher as a background task
pub fn spawn_snapshot_publisher(
    publisher: SnapshotPublisher,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(publisher.run(shutdown))
}

/// Applies snapshots received from peers
pub struct SnapshotListener {
    registry: Arc<NodeRegistry>,
}

impl SnapshotListener {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }

    /// Register on the snapshot channel of a messenger
    pub fn register(registry: Arc<NodeRegistry>, messenger: &Messenger) {
        messenger.register_listener(
            NODE_SNAPSHOT_UPDATE,
            PRIORITY_NORMAL,
            Arc::new(Self::new(registry)),
        );
    }
}

#[async_trait]
impl ChannelListener for SnapshotListener {
    async fn on_message(&self, event: &mut ChannelMessageEvent) {
        let snapshot: NodeSnapshot = match serde_json::from_slice(event.content()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Invalid snapshot from {}: {}", event.sender(), e);
                return;
            }
        };
        // Unknown senders are already logged by the registry
        let _ = self.registry.update_snapshot(event.sender(), snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::NodeIdentity;
    use crate::messaging::{LocalNetwork, Message, TransportEvent};
    use crate::service::{DefaultServiceManager, LocalServiceManager, ServiceConfiguration};

    #[test]
    fn test_collector_reports_reserved_memory() {
        let services = Arc::new(DefaultServiceManager::new("node-a", 4096));
        services
            .start_locally(&ServiceConfiguration::new("lobby", 1024))
            .unwrap();

        let mut collector = SnapshotCollector::new(services);
        let snapshot = collector.collect();

        assert_eq!(snapshot.used_memory_mb, 1024);
        assert_eq!(snapshot.max_memory_mb, 4096);
        assert!(snapshot.system_cpu_usage == CPU_UNKNOWN || snapshot.system_cpu_usage >= 0.0);
    }

    #[tokio::test]
    async fn test_publish_updates_self_and_broadcasts() {
        let network = LocalNetwork::new();
        let identity = NodeIdentity::new("node-a", "local://node-a");
        let (transport, _events) = network.join(identity.clone()).await;
        let (_peer, mut peer_events) = network
            .join(NodeIdentity::new("node-b", "local://node-b"))
            .await;

        let registry = Arc::new(NodeRegistry::new(identity));
        let messenger = Arc::new(Messenger::new(Arc::new(transport)));
        let services = Arc::new(DefaultServiceManager::new("node-a", 2048));
        let mut publisher = SnapshotPublisher::new(
            registry.clone(),
            messenger,
            SnapshotCollector::new(services),
        );

        assert_eq!(publisher.publish_once().await, 1);
        let stored = registry.self_node().snapshot.clone().unwrap();
        assert_eq!(stored.max_memory_mb, 2048);

        loop {
            match peer_events.recv().await {
                Some(TransportEvent::Message(message)) => {
                    assert_eq!(message.channel(), NODE_SNAPSHOT_UPDATE);
                    assert_eq!(message.sender(), "node-a");
                    break;
                }
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_listener_applies_peer_snapshot() {
        let registry = Arc::new(NodeRegistry::new(NodeIdentity::new("node-a", "local://a")));
        registry
            .register(NodeIdentity::new("node-b", "local://b"))
            .unwrap();
        let listener = SnapshotListener::new(registry.clone());

        let content = serde_json::to_vec(&NodeSnapshot::new(700, 4096, 12.5)).unwrap();
        let message = Message::new(
            NODE_SNAPSHOT_UPDATE,
            "node-b",
            vec![ChannelTarget::all()],
            content,
        )
        .unwrap();
        listener
            .on_message(&mut ChannelMessageEvent::new(message))
            .await;

        let snapshot = registry.node("node-b").unwrap().snapshot.clone().unwrap();
        assert_eq!(snapshot.used_memory_mb, 700);
    }

    #[tokio::test]
    async fn test_listener_ignores_garbage() {
        let registry = Arc::new(NodeRegistry::new(NodeIdentity::new("node-a", "local://a")));
        registry
            .register(NodeIdentity::new("node-b", "local://b"))
            .unwrap();
        let listener = SnapshotListener::new(registry.clone());

        let message = Message::new(
            NODE_SNAPSHOT_UPDATE,
            "node-b",
            vec![ChannelTarget::all()],
            b"not json".to_vec(),
        )
        .unwrap();
        listener
            .on_message(&mut ChannelMessageEvent::new(message))
            .await;

        assert!(registry.node("node-b").unwrap().snapshot.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_stops_on_shutdown() {
        let network = LocalNetwork::new();
        let identity = NodeIdentity::new("node-a", "local://node-a");
        let (transport, _events) = network.join(identity.clone()).await;
        let registry = Arc::new(NodeRegistry::new(identity));
        let messenger = Arc::new(Messenger::new(Arc::new(transport)));
        let services = Arc::new(DefaultServiceManager::new("node-a", 2048));
        let publisher = SnapshotPublisher::new(registry, messenger, SnapshotCollector::new(services))
            .with_interval(Duration::from_secs(1));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_snapshot_publisher(publisher, shutdown_rx);
        tokio::time::sleep(Duration::from_secs(3)).await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
