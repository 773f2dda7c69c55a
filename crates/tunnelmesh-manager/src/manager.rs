//! Tunnel manager: admits agents and routes HTTP requests to their clusters

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tunnelmesh_proto::headers;
use tunnelmesh_session::{
    Admission, AuthorizeError, Authorizer, PeerCredentials, SessionConfig, SessionServer,
};

use crate::error::{ManagerError, ManagerResult, ProxyError, RouteError};
use crate::indexer::Indexer;
use crate::options::TunnelOptions;
use crate::peer::{PeerManager, PeerManagerOptions};
use crate::proxy::{BackendProxy, BackendTarget};
use crate::registry::{ClusterInfo, ClusterRegistry, Upsert};
use crate::transport::BackendTransport;

/// Admits agents whose token matches and records them in the registry
pub struct ManagerAuthorizer {
    registry: ClusterRegistry,
    token: String,
    address_header: String,
}

impl ManagerAuthorizer {
    pub fn new(registry: ClusterRegistry, token: impl Into<String>, address_header: impl Into<String>) -> Self {
        Self {
            registry,
            token: token.into(),
            address_header: address_header.into(),
        }
    }
}

impl Authorizer for ManagerAuthorizer {
    fn authorize(&self, request_headers: &HeaderMap) -> Result<Admission, AuthorizeError> {
        let header = |name: &str| header_value(request_headers, name);

        let cluster_id = header(headers::TUNNEL_ID);
        if cluster_id.is_empty() {
            return Err(AuthorizeError::MissingHeader(headers::TUNNEL_ID));
        }

        if header(headers::TUNNEL_TOKEN) != self.token {
            warn!(cluster_id = %cluster_id, "Rejected agent with invalid token");
            return Err(AuthorizeError::InvalidToken);
        }

        let server_address = header(&self.address_header);
        if let Upsert::AddressChanged { previous } = self.registry.upsert(cluster_id, server_address) {
            debug!(cluster_id = %cluster_id, previous = %previous, "Agent reconnected with a new address");
        }

        Ok(Admission {
            client_key: cluster_id.to_string(),
            address: (!server_address.is_empty()).then(|| server_address.to_string()),
        })
    }

    fn on_session_removed(&self, client_key: &str) {
        self.registry.remove(client_key);
    }
}

fn header_value<'a>(map: &'a HeaderMap, name: &str) -> &'a str {
    map.get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default()
}

/// Entry point of the tunnel server
#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    indexer: Arc<dyn Indexer>,
    tls: Arc<rustls::ClientConfig>,
    connect_url: String,
    proxy_prefix: String,
    dial_timeout: Duration,
    max_idle_per_host: usize,
    registry: ClusterRegistry,
    sessions: SessionServer,
    peers: PeerManager,
    cancel: CancellationToken,
}

impl TunnelManager {
    /// Validate `options` and assemble the manager. Nothing runs until
    /// [`TunnelManager::start`].
    pub fn new(options: TunnelOptions) -> ManagerResult<Self> {
        options.validate()?;

        let (Some(tls), Some(indexer)) = (options.tls_config.clone(), options.indexer.clone())
        else {
            return Err(ManagerError::Config("incomplete options".to_string()));
        };

        let cancel = options
            .shutdown
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();

        let registry = ClusterRegistry::new();
        let authorizer = Arc::new(ManagerAuthorizer::new(
            registry.clone(),
            options.tunnel_token.clone(),
            options.cluster_address_header.clone(),
        ));

        let sessions = SessionServer::new(
            authorizer,
            PeerCredentials {
                peer_id: options.tunnel_id.clone(),
                token: options.effective_peer_token().to_string(),
            },
            SessionConfig::default().with_dial_timeout(options.dial_timeout),
        )
        .with_peer_tls(options.secure_peers.then(|| tls.clone()));

        let peers = PeerManager::new(
            PeerManagerOptions {
                peer_id: options.tunnel_id.clone(),
                token: options.effective_peer_token().to_string(),
                service_name: options.peer_service_name.clone(),
                connect_path: options.connect_url.clone(),
                secure: options.secure_peers,
                port_metadata_key: options.peer_port_metadata_key.clone(),
                retry_interval: options.peer_retry_interval,
                discovery: options.discovery.clone(),
            },
            Arc::new(sessions.clone()),
            cancel.child_token(),
        );

        info!(
            tunnel_id = %options.tunnel_id,
            connect_url = %options.connect_url,
            proxy_prefix = %options.proxy_prefix,
            "Tunnel manager initialized"
        );

        Ok(Self {
            inner: Arc::new(ManagerInner {
                indexer,
                tls,
                connect_url: options.connect_url,
                proxy_prefix: options.proxy_prefix,
                dial_timeout: options.dial_timeout,
                max_idle_per_host: options.max_idle_per_host,
                registry,
                sessions,
                peers,
                cancel,
            }),
        })
    }

    /// Start peer discovery in the background
    pub fn start(&self) -> ManagerResult<()> {
        self.inner.peers.start()?;
        Ok(())
    }

    /// Stop peer discovery and every task derived from this manager
    pub fn shutdown(&self) {
        info!("Shutting down tunnel manager");
        self.inner.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.inner.registry
    }

    pub fn sessions(&self) -> &SessionServer {
        &self.inner.sessions
    }

    pub fn peer_manager(&self) -> &PeerManager {
        &self.inner.peers
    }

    /// Router serving the session endpoint and the proxy
    pub fn router(&self) -> Router {
        let connect = self.clone();
        let proxy = self.clone();

        Router::new()
            .route(
                &self.inner.connect_url,
                any(move |request: Request<Body>| {
                    let manager = connect.clone();
                    async move { manager.inner.sessions.serve_connect(request).await }
                }),
            )
            .fallback(move |request: Request<Body>| {
                let manager = proxy.clone();
                async move { manager.serve_http(request).await }
            })
    }

    /// Route one request to its cluster.
    ///
    /// Routing failures answer 502, proxy failures 500.
    pub async fn serve_http(&self, request: Request<Body>) -> Response {
        if !request.uri().path().starts_with(self.inner.proxy_prefix.as_str()) {
            return StatusCode::NOT_FOUND.into_response();
        }

        let backend = self
            .inner
            .indexer
            .index(&request)
            .map_err(RouteError::from)
            .and_then(|cluster_id| self.backend_for(&cluster_id));

        let backend = match backend {
            Ok(backend) => backend,
            Err(e) => {
                debug!(uri = %request.uri(), error = %e, "Failed to route request");
                return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
            }
        };

        match backend.forward(request).await {
            Ok(response) => response,
            Err(e) => proxy_error(e),
        }
    }

    /// Backend entry point for `cluster_id`, building its transport on first
    /// use
    pub fn backend_for(&self, cluster_id: &str) -> Result<BackendProxy, RouteError> {
        let inner = &self.inner;
        let mut clusters = inner.registry.write();

        if !inner.sessions.has_session(cluster_id) {
            return Err(RouteError::NoSession(cluster_id.to_string()));
        }

        let info = match clusters.entry(cluster_id.to_string()) {
            Entry::Occupied(entry) => {
                let info = entry.into_mut();
                // Local agents keep the entry current through the authorizer;
                // peer-routed clusters follow the peer's latest advert
                if !inner.sessions.has_local_session(cluster_id) {
                    if let Some(address) = inner
                        .sessions
                        .advertised_address(cluster_id)
                        .filter(|address| *address != info.server_address)
                    {
                        let previous = std::mem::replace(&mut info.server_address, address);
                        let dropped = info.transport.take();
                        info!(
                            cluster_id = %cluster_id,
                            previous = %previous,
                            server_address = %info.server_address,
                            dropped_generation = ?dropped.as_ref().map(BackendTransport::generation),
                            "Peer advertised a new cluster address, discarding cached transport"
                        );
                    }
                }
                info
            }
            Entry::Vacant(entry) => {
                // Evicted by a racing teardown, or reachable only through a
                // peer; adopt the advertised address
                let address = inner
                    .sessions
                    .advertised_address(cluster_id)
                    .ok_or_else(|| RouteError::NoAddress(cluster_id.to_string()))?;
                info!(cluster_id = %cluster_id, server_address = %address, "Registering cluster from advertised address");
                entry.insert(ClusterInfo::new(cluster_id, address))
            }
        };

        let target = BackendTarget::parse(&info.server_address).map_err(|e| {
            RouteError::InvalidAddress {
                cluster_id: cluster_id.to_string(),
                address: info.server_address.clone(),
                reason: e.to_string(),
            }
        })?;

        let transport = info
            .transport
            .get_or_insert_with(|| {
                BackendTransport::new(
                    inner.sessions.dialer(cluster_id),
                    Some(inner.tls.clone()),
                    inner.dial_timeout,
                    inner.max_idle_per_host,
                )
            })
            .clone();

        Ok(BackendProxy::new(target, transport))
    }
}

fn proxy_error(e: ProxyError) -> Response {
    error!(error = %e, "Proxy request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}
