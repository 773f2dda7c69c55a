//! Service discovery abstraction used to find peer instances

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// One registered instance of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub id: String,
    /// Advertised `host:port`
    pub address: String,
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Discovery unavailable: {0}")]
    Unavailable(String),

    #[error("Service {0} not found")]
    NotFound(String),
}

/// Why a watch ended
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    #[error("watch interrupted: {0}")]
    Recoverable(String),

    #[error("watcher stopped")]
    Stopped,
}

/// A service registry
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn list(&self, service: &str) -> Result<Vec<ServiceInstance>, DiscoveryError>;

    async fn watch(&self, service: &str) -> Result<Box<dyn ServiceWatcher>, DiscoveryError>;
}

/// Stream of change notifications for one service
#[async_trait]
pub trait ServiceWatcher: Send {
    /// Resolves on the next change
    async fn next(&mut self) -> Result<(), WatchError>;
}

/// Canonical peer address of an instance.
///
/// The advertised address must be exactly `host:port`. A numeric value under
/// `port_metadata_key` replaces the port.
pub fn peer_address(instance: &ServiceInstance, port_metadata_key: &str) -> Result<String, String> {
    let parts: Vec<&str> = instance.address.split(':').collect();
    let (host, port) = match parts.as_slice() {
        [host, port] if !host.is_empty() && !port.is_empty() => (*host, *port),
        _ => return Err(format!("address {:?} is not host:port", instance.address)),
    };

    let port = match instance.metadata.get(port_metadata_key) {
        Some(value) if value.parse::<u16>().is_ok() => value.as_str(),
        _ => port,
    };

    Ok(format!("{}:{}", host, port))
}

/// In-memory registry whose contents are set by the owner
#[derive(Clone)]
pub struct StaticDiscovery {
    services: Arc<watch::Sender<HashMap<String, Vec<ServiceInstance>>>>,
}

impl Default for StaticDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticDiscovery {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(HashMap::new());
        Self {
            services: Arc::new(tx),
        }
    }

    pub fn with_service(self, service: &str, instances: Vec<ServiceInstance>) -> Self {
        self.set_instances(service, instances);
        self
    }

    /// Replace the instances of `service`, notifying watchers
    pub fn set_instances(&self, service: &str, instances: Vec<ServiceInstance>) {
        self.services.send_modify(|services| {
            services.insert(service.to_string(), instances);
        });
    }

    pub fn instances(&self, service: &str) -> Vec<ServiceInstance> {
        self.services
            .borrow()
            .get(service)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn list(&self, service: &str) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        Ok(self.instances(service))
    }

    async fn watch(&self, _service: &str) -> Result<Box<dyn ServiceWatcher>, DiscoveryError> {
        Ok(Box::new(StaticWatcher {
            rx: self.services.subscribe(),
        }))
    }
}

struct StaticWatcher {
    rx: watch::Receiver<HashMap<String, Vec<ServiceInstance>>>,
}

#[async_trait]
impl ServiceWatcher for StaticWatcher {
    async fn next(&mut self) -> Result<(), WatchError> {
        self.rx.changed().await.map_err(|_| WatchError::Stopped)
    }
}
