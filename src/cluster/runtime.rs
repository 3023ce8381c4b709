//! Cluster runtime - one node's coordination stack
//!
//! Wires the registry, messenger and orchestrator of a node together and
//! translates transport events into registry and messenger updates.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::head::HeadNodeResolver;
use super::node::NodeIdentity;
use super::orchestrator::{CreateServiceError, ServiceOrchestrator};
use super::registry::NodeRegistry;
use super::snapshot::{SnapshotCollector, SnapshotListener, SnapshotPublisher};
use crate::messaging::{Messenger, Transport, TransportEvent, TransportEventReceiver};
use crate::service::{ServiceConfiguration, ServiceInfoSnapshot, SharedServiceManager};

/// Coordination stack of a single node
pub struct ClusterRuntime {
    registry: Arc<NodeRegistry>,
    messenger: Arc<Messenger>,
    orchestrator: Arc<ServiceOrchestrator>,
    services: SharedServiceManager,
}

impl ClusterRuntime {
    /// Build the stack on top of a transport and register its channel listeners
    pub fn new(
        transport: Arc<dyn Transport>,
        services: SharedServiceManager,
        query_timeout: Duration,
    ) -> Arc<Self> {
        let registry = Arc::new(NodeRegistry::new(transport.local_identity().clone()));
        let messenger = Arc::new(Messenger::new(transport).with_query_timeout(query_timeout));

        let orchestrator =
            ServiceOrchestrator::new(registry.clone(), messenger.clone(), services.clone());
        orchestrator.register_listeners();
        SnapshotListener::register(registry.clone(), &messenger);

        Arc::new(Self {
            registry,
            messenger,
            orchestrator,
            services,
        })
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    pub fn resolver(&self) -> &HeadNodeResolver {
        self.orchestrator.resolver()
    }

    /// Register peers known up front; they stay unavailable until connected
    pub fn add_peers(&self, peers: impl IntoIterator<Item = NodeIdentity>) {
        for peer in peers {
            if let Err(e) = self.registry.register(peer) {
                debug!("Skipping peer: {}", e);
            }
        }
    }

    /// Create a service somewhere in the cluster
    pub async fn create_service(
        &self,
        configuration: ServiceConfiguration,
    ) -> Result<ServiceInfoSnapshot, CreateServiceError> {
        self.orchestrator.create_service(configuration).await
    }

    /// A snapshot publisher for this node
    pub fn snapshot_publisher(&self, interval: Duration) -> SnapshotPublisher {
        SnapshotPublisher::new(
            self.registry.clone(),
            self.messenger.clone(),
            SnapshotCollector::new(self.services.clone()),
        )
        .with_interval(interval)
    }

    /// Apply one transport event
    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(identity) => {
                let id = identity.id.clone();
                if self.registry.is_self(&id) {
                    return;
                }
                if self.registry.node(&id).is_none() {
                    if let Err(e) = self.registry.register(identity) {
                        debug!("Peer {} registered concurrently: {}", id, e);
                    }
                }
                let _ = self.registry.mark_connected(&id, true);
            }
            TransportEvent::Disconnected(id) => {
                let _ = self.registry.mark_connected(&id, false);
                self.messenger.close_inbound(&id);
                let failed = self.messenger.fail_pending_for(&id);
                if failed > 0 {
                    info!("Failed {} pending queries to disconnected node {}", failed, id);
                }
            }
            TransportEvent::Message(message) => self.messenger.handle_incoming(message),
        }
    }

    /// Consume transport events until the channel closes or shutdown fires
    pub fn spawn(
        self: &Arc<Self>,
        mut events: TransportEventReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => runtime.handle_event(event),
                        None => {
                            debug!("Transport event channel closed");
                            break;
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Cluster runtime shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::LocalNetwork;
    use crate::service::DefaultServiceManager;

    async fn runtime(network: &Arc<LocalNetwork>, id: &str) -> (Arc<ClusterRuntime>, TransportEventReceiver) {
        let (transport, events) = network
            .join(NodeIdentity::new(id, format!("local://{}", id)))
            .await;
        let services = Arc::new(DefaultServiceManager::new(id, 4096));
        (
            ClusterRuntime::new(Arc::new(transport), services, Duration::from_secs(5)),
            events,
        )
    }

    #[tokio::test]
    async fn test_connected_registers_peer() {
        let network = LocalNetwork::new();
        let (a, _a_events) = runtime(&network, "node-a").await;

        a.handle_event(TransportEvent::Connected(NodeIdentity::new("node-b", "local://node-b")));

        let peer = a.registry().node("node-b").unwrap();
        assert!(peer.available);
        assert_eq!(a.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_disconnected_marks_unavailable() {
        let network = LocalNetwork::new();
        let (b, _b_events) = runtime(&network, "node-b").await;
        b.handle_event(TransportEvent::Connected(NodeIdentity::new("node-a", "local://node-a")));
        assert_eq!(b.resolver().head_node().id(), "node-a");

        b.handle_event(TransportEvent::Disconnected("node-a".to_string()));

        assert!(!b.registry().node("node-a").unwrap().available);
        assert!(b.resolver().is_self_head());
    }

    #[tokio::test]
    async fn test_add_peers_starts_unavailable() {
        let network = LocalNetwork::new();
        let (a, _a_events) = runtime(&network, "node-a").await;

        a.add_peers(vec![
            NodeIdentity::new("node-b", "10.0.0.2:4300"),
            NodeIdentity::new("node-a", "10.0.0.1:4300"),
        ]);

        assert_eq!(a.registry().len(), 2);
        assert!(!a.registry().node("node-b").unwrap().available);
    }

    #[tokio::test]
    async fn test_spawned_runtime_stops_on_shutdown() {
        let network = LocalNetwork::new();
        let (a, events) = runtime(&network, "node-a").await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = a.spawn(events, shutdown_rx);
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
