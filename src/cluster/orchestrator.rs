//! Service Orchestrator - the entry point for creating services
//!
//! Routing is two-tier. A node that is not the head forwards the whole request
//! to the head. The head runs placement and either starts the service itself
//! or pushes it to exactly one chosen node. A request therefore crosses at most
//! two hops, each bounded by the query timeout.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::head::HeadNodeResolver;
use super::node::{ClusterNode, NodeSnapshot};
use super::placement::PlacementPlanner;
use super::registry::NodeRegistry;
use crate::messaging::{
    ChannelListener, ChannelMessageEvent, ChannelTarget, Messenger, MessengerError,
    PRIORITY_NORMAL,
};
use crate::service::{
    ServiceConfiguration, ServiceInfoSnapshot, ServiceManagerError, SharedServiceManager,
};

/// Channel the head uses to make a node start a service
pub const HEAD_NODE_TO_NODE_START_SERVICE: &str = "head_node_to_node_start_service";

/// Channel a non-head node uses to hand a request to the head
pub const NODE_TO_HEAD_START_SERVICE: &str = "node_to_head_start_service";

/// Why a service could not be started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    NoResponse,
    InvalidTarget,
    NoCapacity,
    InvalidConfiguration,
    LocalStartFailed,
    Codec,
}

/// A service could not be started
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CreateServiceError {
    #[error("No response from node '{0}'")]
    NoResponse(String),

    #[error("Node '{0}' cannot be addressed")]
    InvalidTarget(String),

    #[error("No capacity for the service: {0}")]
    NoCapacity(String),

    #[error("Invalid service configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Starting the service locally failed: {0}")]
    LocalStartFailed(String),

    #[error("Failed to encode or decode service data: {0}")]
    Codec(String),
}

impl CreateServiceError {
    pub fn reason(&self) -> FailureReason {
        match self {
            CreateServiceError::NoResponse(_) => FailureReason::NoResponse,
            CreateServiceError::InvalidTarget(_) => FailureReason::InvalidTarget,
            CreateServiceError::NoCapacity(_) => FailureReason::NoCapacity,
            CreateServiceError::InvalidConfiguration(_) => FailureReason::InvalidConfiguration,
            CreateServiceError::LocalStartFailed(_) => FailureReason::LocalStartFailed,
            CreateServiceError::Codec(_) => FailureReason::Codec,
        }
    }
}

impl From<ServiceManagerError> for CreateServiceError {
    fn from(err: ServiceManagerError) -> Self {
        match err {
            ServiceManagerError::NoCapacity { .. } => CreateServiceError::NoCapacity(err.to_string()),
            ServiceManagerError::InvalidConfiguration(msg) => {
                CreateServiceError::InvalidConfiguration(msg)
            }
            ServiceManagerError::DuplicateName(_) => {
                CreateServiceError::LocalStartFailed(err.to_string())
            }
        }
    }
}

/// Where a create request goes next
#[derive(Debug, Clone)]
pub enum Route {
    /// Start on this node
    Local,
    /// This node is head and picked another node
    Remote(Arc<ClusterNode>),
    /// This node is not head; hand the request over
    ForwardToHead(Arc<ClusterNode>),
}

/// Creates services somewhere in the cluster
pub struct ServiceOrchestrator {
    registry: Arc<NodeRegistry>,
    resolver: HeadNodeResolver,
    planner: PlacementPlanner,
    messenger: Arc<Messenger>,
    services: SharedServiceManager,
}

impl ServiceOrchestrator {
    pub fn new(
        registry: Arc<NodeRegistry>,
        messenger: Arc<Messenger>,
        services: SharedServiceManager,
    ) -> Arc<Self> {
        Arc::new(Self {
            resolver: HeadNodeResolver::new(registry.clone()),
            planner: PlacementPlanner::new(registry.clone()),
            registry,
            messenger,
            services,
        })
    }

    /// Answer start requests arriving from other nodes
    pub fn register_listeners(self: &Arc<Self>) {
        for (channel, role) in [
            (HEAD_NODE_TO_NODE_START_SERVICE, StartRole::Target),
            (NODE_TO_HEAD_START_SERVICE, StartRole::Head),
        ] {
            self.messenger.register_listener(
                channel,
                PRIORITY_NORMAL,
                Arc::new(StartServiceListener {
                    orchestrator: Arc::downgrade(self),
                    role,
                }),
            );
        }
    }

    pub fn resolver(&self) -> &HeadNodeResolver {
        &self.resolver
    }

    /// Decide where a request for `configuration` goes from this node
    ///
    /// The head is read once: a head that disconnects mid-decision must not
    /// turn into a forward to ourselves.
    pub fn route(&self, configuration: &ServiceConfiguration) -> Route {
        let head = self.resolver.head_node();
        if !self.registry.is_self(head.id()) {
            return Route::ForwardToHead(head);
        }
        self.head_route(configuration)
    }

    fn head_route(&self, configuration: &ServiceConfiguration) -> Route {
        self.refresh_self_memory();
        match self.planner.select_target(&configuration.resource_request()) {
            Some(target) if !self.registry.is_self(target.id()) => Route::Remote(target),
            _ => Route::Local,
        }
    }

    /// Raise our own snapshot to the memory reserved right now
    ///
    /// The published snapshot lags behind services started since the last
    /// tick; without this a burst of requests piles onto the head.
    fn refresh_self_memory(&self) {
        let self_node = self.registry.self_node();
        let Some(current) = self_node.snapshot.as_ref() else {
            return;
        };
        let reserved = self.services.reserved_memory_mb();
        if reserved <= current.used_memory_mb {
            return;
        }
        let live = NodeSnapshot::new(reserved, current.max_memory_mb, current.system_cpu_usage);
        if let Err(e) = self.registry.update_snapshot(self.registry.self_id(), live) {
            debug!("Could not refresh local snapshot: {}", e);
        }
    }

    /// Create a service on the best node of the cluster
    pub async fn create_service(
        &self,
        configuration: ServiceConfiguration,
    ) -> Result<ServiceInfoSnapshot, CreateServiceError> {
        configuration.validate()?;

        match self.route(&configuration) {
            Route::ForwardToHead(head) => {
                info!(
                    "Forwarding service {} to head node {}",
                    configuration.task_name,
                    head.id()
                );
                self.start_remote(NODE_TO_HEAD_START_SERVICE, head.id(), &configuration)
                    .await
            }
            route => self.execute_head_route(route, &configuration).await,
        }
    }

    /// Placement as head, used for local requests and requests forwarded to us
    ///
    /// Never forwards again, even if our own view has since moved the head
    /// elsewhere; that keeps every request within two hops.
    async fn place_as_head(
        &self,
        configuration: &ServiceConfiguration,
    ) -> Result<ServiceInfoSnapshot, CreateServiceError> {
        configuration.validate()?;
        let route = self.head_route(configuration);
        self.execute_head_route(route, configuration).await
    }

    async fn execute_head_route(
        &self,
        route: Route,
        configuration: &ServiceConfiguration,
    ) -> Result<ServiceInfoSnapshot, CreateServiceError> {
        match route {
            Route::Remote(target) => {
                info!(
                    "Placing service {} on node {}",
                    configuration.task_name,
                    target.id()
                );
                self.start_remote(HEAD_NODE_TO_NODE_START_SERVICE, target.id(), configuration)
                    .await
            }
            Route::Local | Route::ForwardToHead(_) => self.start_local(configuration),
        }
    }

    fn start_local(
        &self,
        configuration: &ServiceConfiguration,
    ) -> Result<ServiceInfoSnapshot, CreateServiceError> {
        debug!(
            "Starting service {} on local node {}",
            configuration.task_name,
            self.registry.self_id()
        );
        self.services
            .start_locally(configuration)
            .map_err(CreateServiceError::from)
    }

    async fn start_remote(
        &self,
        channel: &str,
        node_id: &str,
        configuration: &ServiceConfiguration,
    ) -> Result<ServiceInfoSnapshot, CreateServiceError> {
        let content = serde_json::to_vec(configuration)
            .map_err(|e| CreateServiceError::Codec(e.to_string()))?;
        let message = self
            .messenger
            .message(channel, vec![ChannelTarget::node(node_id)], content)
            .map_err(|_| CreateServiceError::InvalidTarget(node_id.to_string()))?;

        let response = match self.messenger.query(message).await {
            Ok(response) => response,
            Err(MessengerError::InvalidTarget { .. }) | Err(MessengerError::Message(_)) => {
                return Err(CreateServiceError::InvalidTarget(node_id.to_string()))
            }
            Err(e) => {
                warn!("Start request to {} failed: {}", node_id, e);
                return Err(CreateServiceError::NoResponse(node_id.to_string()));
            }
        };

        match response {
            Some(message) if !message.content().is_empty() => {
                serde_json::from_slice(message.content())
                    .map_err(|e| CreateServiceError::Codec(e.to_string()))
            }
            _ => {
                warn!("Node {} did not start the service", node_id);
                Err(CreateServiceError::NoResponse(node_id.to_string()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum StartRole {
    /// We were chosen by the head and start locally
    Target,
    /// A non-head node asked us, as head, to place the service
    Head,
}

struct StartServiceListener {
    orchestrator: Weak<ServiceOrchestrator>,
    role: StartRole,
}

#[async_trait]
impl ChannelListener for StartServiceListener {
    async fn on_message(&self, event: &mut ChannelMessageEvent) {
        let Some(orchestrator) = self.orchestrator.upgrade() else {
            return;
        };
        if !event.is_query() {
            debug!("Ignoring start request from {} sent without query", event.sender());
            return;
        }

        let configuration: ServiceConfiguration = match serde_json::from_slice(event.content()) {
            Ok(configuration) => configuration,
            Err(e) => {
                warn!("Invalid start request from {}: {}", event.sender(), e);
                return;
            }
        };

        let result = match self.role {
            StartRole::Target => orchestrator.start_local(&configuration),
            StartRole::Head => orchestrator.place_as_head(&configuration).await,
        };

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    "Could not start service {} for {}: {}",
                    configuration.task_name,
                    event.sender(),
                    e
                );
                return;
            }
        };

        match serde_json::to_vec(&snapshot) {
            Ok(content) => {
                if let Err(e) = event.set_response(content) {
                    warn!("Start request from {} already answered: {}", event.sender(), e);
                }
            }
            Err(e) => warn!("Failed to encode service snapshot: {}", e),
        }
    }
}
