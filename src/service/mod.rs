//! Cloud services - configuration, runtime snapshots and the local manager
//!
//! The cluster layer only needs two things from the local process supervisor:
//! start a service from a [`ServiceConfiguration`] and report how much memory
//! is reserved on this node. [`DefaultServiceManager`] keeps the bookkeeping in
//! memory; spawning the worker process is left to the supervisor behind it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Errors from the local service manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceManagerError {
    #[error("Not enough memory: requested {requested_mb} MB, {available_mb} MB available")]
    NoCapacity { requested_mb: u64, available_mb: u64 },

    #[error("Service '{0}' already exists on this node")]
    DuplicateName(String),

    #[error("Invalid service configuration: {0}")]
    InvalidConfiguration(String),
}

/// The part of a service configuration that placement looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceResourceRequest {
    /// Requested heap memory in megabytes
    #[serde(rename = "memoryMb")]
    pub memory_mb: u64,
}

/// Configuration submitted by an administrator to create a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfiguration {
    /// Task the service belongs to (e.g., "lobby")
    #[serde(rename = "taskName")]
    pub task_name: String,

    /// Explicit service name; assigned as `<task>-<n>` when absent
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Maximum heap memory in megabytes
    #[serde(rename = "maxHeapMemoryMb")]
    pub max_heap_memory_mb: u64,

    /// Groups the service joins
    #[serde(default)]
    pub groups: Vec<String>,

    /// Preferred start port
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Free-form properties handed to the supervisor
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl ServiceConfiguration {
    pub fn new(task_name: impl Into<String>, max_heap_memory_mb: u64) -> Self {
        Self {
            task_name: task_name.into(),
            name: None,
            max_heap_memory_mb,
            groups: vec![],
            port: None,
            properties: HashMap::new(),
        }
    }

    /// Set an explicit service name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add a group
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn resource_request(&self) -> ServiceResourceRequest {
        ServiceResourceRequest {
            memory_mb: self.max_heap_memory_mb,
        }
    }

    /// Check the configuration before it is accepted
    pub fn validate(&self) -> Result<(), ServiceManagerError> {
        if self.task_name.trim().is_empty() {
            return Err(ServiceManagerError::InvalidConfiguration(
                "task name must not be empty".to_string(),
            ));
        }
        if matches!(&self.name, Some(name) if name.trim().is_empty()) {
            return Err(ServiceManagerError::InvalidConfiguration(
                "service name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ServiceLifecycle {
    /// Registered and waiting for the supervisor to start the process
    #[default]
    Prepared,
    /// Process is running
    Running,
    /// Process has stopped
    Stopped,
}

/// Description of a created service instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfoSnapshot {
    /// Unique id of the service
    #[serde(rename = "serviceId")]
    pub service_id: Uuid,

    /// Service name (e.g., "lobby-1")
    pub name: String,

    #[serde(rename = "taskName")]
    pub task_name: String,

    /// Node hosting the service
    #[serde(rename = "nodeId")]
    pub node_id: String,

    pub lifecycle: ServiceLifecycle,

    /// Heap memory reserved for the service in megabytes
    #[serde(rename = "memoryMb")]
    pub memory_mb: u64,

    #[serde(default)]
    pub groups: Vec<String>,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Starts services on the local node
pub trait LocalServiceManager: Send + Sync {
    /// Create a service on this node
    fn start_locally(
        &self,
        configuration: &ServiceConfiguration,
    ) -> Result<ServiceInfoSnapshot, ServiceManagerError>;

    /// Memory currently reserved by local services, in megabytes
    fn reserved_memory_mb(&self) -> u64;

    /// Memory budget of this node for services, in megabytes
    fn max_memory_mb(&self) -> u64;
}

/// Shared handle to a local service manager
pub type SharedServiceManager = Arc<dyn LocalServiceManager>;

/// In-memory service bookkeeping for one node
pub struct DefaultServiceManager {
    node_id: String,
    max_memory_mb: u64,
    reserved_memory_mb: AtomicU64,
    services: DashMap<Uuid, ServiceInfoSnapshot>,
    names: DashMap<String, Uuid>,
    task_counters: DashMap<String, u32>,
}

impl DefaultServiceManager {
    pub fn new(node_id: impl Into<String>, max_memory_mb: u64) -> Self {
        Self {
            node_id: node_id.into(),
            max_memory_mb,
            reserved_memory_mb: AtomicU64::new(0),
            services: DashMap::new(),
            names: DashMap::new(),
            task_counters: DashMap::new(),
        }
    }

    /// All services created on this node
    pub fn services(&self) -> Vec<ServiceInfoSnapshot> {
        self.services.iter().map(|r| r.clone()).collect()
    }

    /// Look up a service by id
    pub fn service(&self, id: &Uuid) -> Option<ServiceInfoSnapshot> {
        self.services.get(id).map(|r| r.clone())
    }

    /// Remove a service and release its memory
    pub fn remove_service(&self, id: &Uuid) -> Option<ServiceInfoSnapshot> {
        let (_, snapshot) = self.services.remove(id)?;
        self.names.remove(&snapshot.name);
        self.reserved_memory_mb
            .fetch_sub(snapshot.memory_mb, Ordering::SeqCst);
        info!("Removed service {} from node {}", snapshot.name, self.node_id);
        Some(snapshot)
    }

    fn reserve(&self, requested_mb: u64) -> Result<(), ServiceManagerError> {
        self.reserved_memory_mb
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |reserved| {
                reserved
                    .checked_add(requested_mb)
                    .filter(|total| *total <= self.max_memory_mb)
            })
            .map(|_| ())
            .map_err(|reserved| ServiceManagerError::NoCapacity {
                requested_mb,
                available_mb: self.max_memory_mb.saturating_sub(reserved),
            })
    }

    fn release(&self, mb: u64) {
        self.reserved_memory_mb.fetch_sub(mb, Ordering::SeqCst);
    }

    fn next_name(&self, task_name: &str) -> String {
        loop {
            let index = {
                let mut counter = self.task_counters.entry(task_name.to_string()).or_insert(0);
                *counter += 1;
                *counter
            };
            let name = format!("{}-{}", task_name, index);
            if !self.names.contains_key(&name) {
                return name;
            }
        }
    }
}

impl LocalServiceManager for DefaultServiceManager {
    fn start_locally(
        &self,
        configuration: &ServiceConfiguration,
    ) -> Result<ServiceInfoSnapshot, ServiceManagerError> {
        configuration.validate()?;
        self.reserve(configuration.max_heap_memory_mb)?;

        let service_id = Uuid::new_v4();
        let name = match &configuration.name {
            Some(name) => name.clone(),
            None => self.next_name(&configuration.task_name),
        };

        // Claim the name atomically; a concurrent start may have taken it
        match self.names.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                self.release(configuration.max_heap_memory_mb);
                return Err(ServiceManagerError::DuplicateName(name));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(service_id);
            }
        }

        let snapshot = ServiceInfoSnapshot {
            service_id,
            name,
            task_name: configuration.task_name.clone(),
            node_id: self.node_id.clone(),
            lifecycle: ServiceLifecycle::Prepared,
            memory_mb: configuration.max_heap_memory_mb,
            groups: configuration.groups.clone(),
            created_at: Utc::now(),
        };
        self.services.insert(service_id, snapshot.clone());

        debug!(
            "Reserved {} MB for service {} on node {}",
            snapshot.memory_mb, snapshot.name, self.node_id
        );
        info!("Created service {} on node {}", snapshot.name, self.node_id);
        Ok(snapshot)
    }

    fn reserved_memory_mb(&self) -> u64 {
        self.reserved_memory_mb.load(Ordering::SeqCst)
    }

    fn max_memory_mb(&self) -> u64 {
        self.max_memory_mb
    }
}
