//! Tunnel manager configuration

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tunnelmesh_proto::{headers, DEFAULT_DIAL_TIMEOUT_SECS};

use crate::discovery::Discovery;
use crate::error::{ManagerError, ManagerResult};
use crate::indexer::Indexer;

pub const DEFAULT_CONNECT_URL: &str = "/tunnel/connect";
pub const DEFAULT_PEER_PORT_METADATA_KEY: &str = "http_port";

/// Configuration of a [`crate::TunnelManager`]
#[derive(Clone)]
pub struct TunnelOptions {
    /// This instance's `host:port` as registered in discovery; also its
    /// identity towards peers
    pub tunnel_id: String,
    /// Shared secret expected from agents, and from peers unless
    /// `peer_token` is set
    pub tunnel_token: String,
    /// Separate secret for peer sessions
    pub peer_token: Option<String>,
    /// Header in which agents advertise their backend address
    pub cluster_address_header: String,
    /// Path of the session endpoint
    pub connect_url: String,
    /// TLS client config for https backends and wss peers
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    pub peer_service_name: String,
    pub discovery: Option<Arc<dyn Discovery>>,
    pub indexer: Option<Arc<dyn Indexer>>,
    /// Only requests under this path prefix are proxied
    pub proxy_prefix: String,
    pub dial_timeout: Duration,
    pub max_idle_per_host: usize,
    pub peer_retry_interval: Duration,
    pub peer_port_metadata_key: String,
    /// Dial peers over `wss`
    pub secure_peers: bool,
    /// Parent cancellation; the manager cancels a child of it on shutdown
    pub shutdown: Option<CancellationToken>,
}

impl TunnelOptions {
    pub fn new(tunnel_id: impl Into<String>, tunnel_token: impl Into<String>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            tunnel_token: tunnel_token.into(),
            peer_token: None,
            cluster_address_header: headers::DEFAULT_CLUSTER_ADDRESS.to_string(),
            connect_url: DEFAULT_CONNECT_URL.to_string(),
            tls_config: None,
            peer_service_name: String::new(),
            discovery: None,
            indexer: None,
            proxy_prefix: "/".to_string(),
            dial_timeout: Duration::from_secs(DEFAULT_DIAL_TIMEOUT_SECS),
            max_idle_per_host: 10,
            peer_retry_interval: Duration::from_secs(3),
            peer_port_metadata_key: DEFAULT_PEER_PORT_METADATA_KEY.to_string(),
            secure_peers: true,
            shutdown: None,
        }
    }

    /// Require a different token from peers than from agents
    pub fn with_peer_token(mut self, token: impl Into<String>) -> Self {
        self.peer_token = Some(token.into());
        self
    }

    /// Token peers present and expect
    pub fn effective_peer_token(&self) -> &str {
        self.peer_token.as_deref().unwrap_or(&self.tunnel_token)
    }

    pub fn with_cluster_address_header(mut self, header: impl Into<String>) -> Self {
        self.cluster_address_header = header.into();
        self
    }

    pub fn with_connect_url(mut self, url: impl Into<String>) -> Self {
        self.connect_url = url.into();
        self
    }

    pub fn with_tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Service name peers register under, and the registry to find them in
    pub fn with_peer_discovery(
        mut self,
        service_name: impl Into<String>,
        discovery: Arc<dyn Discovery>,
    ) -> Self {
        self.peer_service_name = service_name.into();
        self.discovery = Some(discovery);
        self
    }

    pub fn with_indexer(mut self, indexer: Arc<dyn Indexer>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    pub fn with_proxy_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.proxy_prefix = prefix.into();
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_max_idle_per_host(mut self, max_idle: usize) -> Self {
        self.max_idle_per_host = max_idle;
        self
    }

    pub fn with_peer_retry_interval(mut self, interval: Duration) -> Self {
        self.peer_retry_interval = interval;
        self
    }

    pub fn with_peer_port_metadata_key(mut self, key: impl Into<String>) -> Self {
        self.peer_port_metadata_key = key.into();
        self
    }

    pub fn with_secure_peers(mut self, secure: bool) -> Self {
        self.secure_peers = secure;
        self
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub fn validate(&self) -> ManagerResult<()> {
        fn required(value: &str, name: &str) -> ManagerResult<()> {
            if value.trim().is_empty() {
                return Err(ManagerError::Config(format!("{} is required", name)));
            }
            Ok(())
        }

        required(&self.tunnel_id, "tunnel id")?;
        required(&self.tunnel_token, "tunnel token")?;
        if let Some(peer_token) = &self.peer_token {
            required(peer_token, "peer token")?;
        }
        required(&self.cluster_address_header, "cluster address header")?;
        required(&self.connect_url, "connect url")?;
        if !self.connect_url.starts_with('/') {
            return Err(ManagerError::Config(
                "connect url must start with '/'".to_string(),
            ));
        }
        if self.tls_config.is_none() {
            return Err(ManagerError::Config("TLS config is required".to_string()));
        }
        required(&self.peer_service_name, "peer service name")?;
        if self.discovery.is_none() {
            return Err(ManagerError::Config(
                "a discovery client is required".to_string(),
            ));
        }
        if self.indexer.is_none() {
            return Err(ManagerError::Config("an indexer is required".to_string()));
        }
        if !self.proxy_prefix.starts_with('/') {
            return Err(ManagerError::Config(
                "proxy prefix must start with '/'".to_string(),
            ));
        }
        Ok(())
    }
}
