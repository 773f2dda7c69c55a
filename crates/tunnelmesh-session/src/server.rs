//! Session server: accepts agent and peer sessions and routes dials to them
//!
//! Agents connect with identity headers checked by an [`Authorizer`]. Peers
//! (other server instances) connect with the peer-id header and the shared
//! peer token. Every local agent is advertised to inbound peer sessions, so a
//! server can reach an agent connected to any of its peers.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunnelmesh_proto::{headers as tunnel_headers, ClientAdvert, ConnectRequest};

use crate::config::SessionConfig;
use crate::conn::SessionConn;
use crate::error::{SessionError, SessionResult};
use crate::session::{AsyncIo, ConnectHandler, Session};

/// Outcome of a successful agent admission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Key the session is registered under
    pub client_key: String,
    /// Address the agent advertised for itself, forwarded to peers
    pub address: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuthorizeError {
    #[error("missing header {0}")]
    MissingHeader(&'static str),

    #[error("invalid token")]
    InvalidToken,

    #[error("{0}")]
    Denied(String),
}

/// Admission policy for agent sessions
pub trait Authorizer: Send + Sync {
    fn authorize(&self, headers: &HeaderMap) -> Result<Admission, AuthorizeError>;

    /// Called once the last local session registered under `client_key` ends
    fn on_session_removed(&self, _client_key: &str) {}
}

/// Identity this server presents to peers and expects from them
#[derive(Debug, Clone)]
pub struct PeerCredentials {
    pub peer_id: String,
    pub token: String,
}

/// Accepts sessions and dials through them
#[derive(Clone)]
pub struct SessionServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    authorizer: Arc<dyn Authorizer>,
    credentials: PeerCredentials,
    peer_tls: Option<Arc<rustls::ClientConfig>>,
    config: SessionConfig,
    state: RwLock<ServerState>,
    next_peer_generation: AtomicU64,
}

#[derive(Default)]
struct ServerState {
    /// Local agent sessions; the newest session for a key wins
    clients: HashMap<String, Vec<ClientSession>>,
    /// Sessions opened to us by peers, keyed by session id
    peer_listeners: HashMap<u64, Session>,
    /// Sessions we maintain to peers, keyed by peer id
    peers: HashMap<String, PeerLink>,
}

struct ClientSession {
    session: Session,
    address: Option<String>,
}

struct PeerLink {
    url: String,
    generation: u64,
    cancel: CancellationToken,
    session: Option<Session>,
}

enum Inbound {
    Client(Admission),
    Peer(String),
}

impl SessionServer {
    pub fn new(
        authorizer: Arc<dyn Authorizer>,
        credentials: PeerCredentials,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                authorizer,
                credentials,
                peer_tls: None,
                config,
                state: RwLock::new(ServerState::default()),
                next_peer_generation: AtomicU64::new(1),
            }),
        }
    }

    /// TLS config used when dialing `wss://` peers.
    ///
    /// Must be called before the server is cloned.
    pub fn with_peer_tls(mut self, tls: Option<Arc<rustls::ClientConfig>>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.peer_tls = tls;
        }
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Handle a session upgrade request.
    ///
    /// Returns 101 and completes the session in the background, 400 for
    /// non-WebSocket requests, or 401 when admission fails.
    pub async fn serve_connect(&self, mut request: Request<Body>) -> Response {
        let Some(accept_key) = websocket_accept_key(request.headers()) else {
            return (StatusCode::BAD_REQUEST, "expected websocket upgrade").into_response();
        };

        let inbound = match self.inner.admit(request.headers()) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(error = %e, "Rejected session upgrade");
                return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
            }
        };

        let Ok(accept_value) = HeaderValue::from_str(&accept_key) else {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        };

        let on_upgrade = hyper::upgrade::on(&mut request);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let ws =
                        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                            .await;
                    inner.run_inbound(inbound, ws).await;
                }
                Err(e) => warn!(error = %e, "Session upgrade failed"),
            }
        });

        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let headers = response.headers_mut();
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept_value);
        response
    }

    /// Whether `client_key` is reachable, locally or through a peer
    pub fn has_session(&self, client_key: &str) -> bool {
        self.inner.route(client_key).is_some()
    }

    /// Whether `client_key` has a session on this server
    pub fn has_local_session(&self, client_key: &str) -> bool {
        self.inner
            .read()
            .clients
            .get(client_key)
            .is_some_and(|sessions| !sessions.is_empty())
    }

    /// Address advertised for `client_key`, by its newest local session or
    /// else by a peer
    pub fn advertised_address(&self, client_key: &str) -> Option<String> {
        let state = self.inner.read();
        if let Some(latest) = state.clients.get(client_key).and_then(|s| s.last()) {
            return latest.address.clone();
        }
        state
            .peers
            .values()
            .filter_map(|link| link.session.as_ref())
            .filter(|session| !session.is_closed())
            .find_map(|session| session.remote_client_address(client_key))
            .flatten()
    }

    /// Keys of locally connected agents
    pub fn client_keys(&self) -> Vec<String> {
        self.inner.read().clients.keys().cloned().collect()
    }

    /// Ids of peers this server maintains sessions to
    pub fn peer_ids(&self) -> Vec<String> {
        self.inner.read().peers.keys().cloned().collect()
    }

    /// Dialer bound to `client_key`. The session is resolved on every dial,
    /// so the dialer survives agent reconnects.
    pub fn dialer(&self, client_key: &str) -> SessionDialer {
        SessionDialer {
            server: self.inner.clone(),
            client_key: client_key.to_string(),
        }
    }

    /// Maintain a session to the peer at `url`, reconnecting until removed
    pub fn add_peer(&self, url: &str, id: &str, token: &str) {
        let generation = self.inner.next_peer_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        {
            let mut state = self.inner.write();
            if let Some(existing) = state.peers.get(id) {
                if existing.url == url {
                    return;
                }
                existing.cancel.cancel();
            }
            state.peers.insert(
                id.to_string(),
                PeerLink {
                    url: url.to_string(),
                    generation,
                    cancel: cancel.clone(),
                    session: None,
                },
            );
        }

        info!(peer_id = %id, url = %url, "Adding peer");
        tokio::spawn(self.inner.clone().run_peer(
            id.to_string(),
            url.to_string(),
            token.to_string(),
            generation,
            cancel,
        ));
    }

    pub fn remove_peer(&self, id: &str) {
        let removed = self.inner.write().peers.remove(id);
        if let Some(link) = removed {
            info!(peer_id = %id, "Removing peer");
            link.cancel.cancel();
            if let Some(session) = link.session {
                session.close();
            }
        }
    }
}

impl ServerInner {
    fn read(&self) -> RwLockReadGuard<'_, ServerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ServerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self, headers: &HeaderMap) -> Result<Inbound, AuthorizeError> {
        if let Some(peer_id) = header_str(headers, tunnel_headers::TUNNEL_PEER_ID) {
            let token = header_str(headers, tunnel_headers::TUNNEL_TOKEN).unwrap_or_default();
            if self.credentials.token.is_empty() || token != self.credentials.token {
                return Err(AuthorizeError::InvalidToken);
            }
            return Ok(Inbound::Peer(peer_id.to_string()));
        }

        self.authorizer.authorize(headers).map(Inbound::Client)
    }

    async fn run_inbound<S>(self: Arc<Self>, inbound: Inbound, ws: WebSocketStream<S>)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        match inbound {
            Inbound::Client(admission) => {
                let session =
                    Session::spawn(ws, Role::Server, admission.client_key.clone(), &self.config, None);
                info!(
                    client_key = %admission.client_key,
                    session_id = session.id(),
                    "Agent session established"
                );
                self.add_client(&session, admission.address);

                session.closed().await;

                let last = self.remove_client(&session);
                info!(
                    client_key = %admission.client_key,
                    session_id = session.id(),
                    uptime_secs = session.uptime().as_secs(),
                    "Agent session ended"
                );
                if last {
                    self.authorizer.on_session_removed(&admission.client_key);
                }
            }
            Inbound::Peer(peer_id) => {
                let forwarder: Arc<dyn ConnectHandler> = Arc::new(PeerForwarder {
                    server: Arc::downgrade(&self),
                });
                let session =
                    Session::spawn(ws, Role::Server, peer_id.clone(), &self.config, Some(forwarder));
                info!(peer_id = %peer_id, session_id = session.id(), "Peer session accepted");
                self.add_peer_listener(&session);

                session.closed().await;

                self.write().peer_listeners.remove(&session.id());
                info!(peer_id = %peer_id, session_id = session.id(), "Peer session ended");
            }
        }
    }

    fn add_client(&self, session: &Session, address: Option<String>) {
        let advert = ClientAdvert {
            client_key: session.client_key().to_string(),
            address: address.clone(),
        };

        let listeners: Vec<Session> = {
            let mut state = self.write();
            state
                .clients
                .entry(session.client_key().to_string())
                .or_default()
                .push(ClientSession {
                    session: session.clone(),
                    address,
                });
            state.peer_listeners.values().cloned().collect()
        };

        for listener in listeners {
            if let Err(e) = listener.advertise_client(&advert) {
                debug!(session_id = listener.id(), error = %e, "Failed to advertise client");
            }
        }
    }

    /// Returns true when `session` was the last one for its key
    fn remove_client(&self, session: &Session) -> bool {
        let key = session.client_key();

        let (last, listeners) = {
            let mut state = self.write();
            let last = match state.clients.get_mut(key) {
                Some(sessions) => {
                    sessions.retain(|c| c.session.id() != session.id());
                    sessions.is_empty()
                }
                None => false,
            };
            if last {
                state.clients.remove(key);
            }
            let listeners: Vec<Session> = if last {
                state.peer_listeners.values().cloned().collect()
            } else {
                Vec::new()
            };
            (last, listeners)
        };

        let advert = ClientAdvert {
            client_key: key.to_string(),
            address: None,
        };
        for listener in listeners {
            if let Err(e) = listener.withdraw_client(&advert) {
                debug!(session_id = listener.id(), error = %e, "Failed to withdraw client");
            }
        }

        last
    }

    fn add_peer_listener(&self, session: &Session) {
        let adverts: Vec<ClientAdvert> = {
            let mut state = self.write();
            state.peer_listeners.insert(session.id(), session.clone());
            state
                .clients
                .iter()
                .filter_map(|(key, sessions)| {
                    sessions.last().map(|latest| ClientAdvert {
                        client_key: key.clone(),
                        address: latest.address.clone(),
                    })
                })
                .collect()
        };

        for advert in &adverts {
            if let Err(e) = session.advertise_client(advert) {
                debug!(session_id = session.id(), error = %e, "Failed to advertise client");
                break;
            }
        }
    }

    fn local_session(&self, client_key: &str) -> Option<Session> {
        self.read()
            .clients
            .get(client_key)
            .and_then(|sessions| sessions.last())
            .map(|latest| latest.session.clone())
    }

    /// Session to dial `client_key` through, and whether it is a peer session
    fn route(&self, client_key: &str) -> Option<(Session, bool)> {
        let state = self.read();

        if let Some(latest) = state.clients.get(client_key).and_then(|s| s.last()) {
            return Some((latest.session.clone(), false));
        }

        state
            .peers
            .values()
            .filter_map(|link| link.session.as_ref())
            .find(|session| !session.is_closed() && session.has_remote_client(client_key))
            .map(|session| (session.clone(), true))
    }

    async fn run_peer(
        self: Arc<Self>,
        id: String,
        url: String,
        token: String,
        generation: u64,
        cancel: CancellationToken,
    ) {
        let mut headers = HeaderMap::new();
        match (
            HeaderValue::from_str(&self.credentials.peer_id),
            HeaderValue::from_str(&token),
        ) {
            (Ok(peer_id), Ok(token)) => {
                headers.insert(tunnel_headers::TUNNEL_PEER_ID, peer_id);
                headers.insert(tunnel_headers::TUNNEL_TOKEN, token);
            }
            _ => {
                warn!(peer_id = %id, "Peer credentials are not valid header values");
                return;
            }
        }

        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return,
                result = crate::connect::dial(&url, &headers, self.peer_tls.clone(), None, &self.config) => result,
            };

            match attempt {
                Ok(session) => {
                    if !self.attach_peer_session(&id, generation, &session) {
                        session.close();
                        return;
                    }
                    info!(peer_id = %id, url = %url, "Peer session established");

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            session.close();
                            return;
                        }
                        _ = session.closed() => {}
                    }

                    self.detach_peer_session(&id, generation);
                    warn!(peer_id = %id, url = %url, "Peer session lost");
                }
                Err(e) => warn!(peer_id = %id, url = %url, error = %e, "Failed to connect to peer"),
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.peer_retry_interval) => {}
            }
        }
    }

    fn attach_peer_session(&self, id: &str, generation: u64, session: &Session) -> bool {
        match self.write().peers.get_mut(id) {
            Some(link) if link.generation == generation => {
                link.session = Some(session.clone());
                true
            }
            _ => false,
        }
    }

    fn detach_peer_session(&self, id: &str, generation: u64) {
        if let Some(link) = self.write().peers.get_mut(id) {
            if link.generation == generation {
                link.session = None;
            }
        }
    }
}

/// Dials connections through whichever session currently serves a client
#[derive(Clone)]
pub struct SessionDialer {
    server: Arc<ServerInner>,
    client_key: String,
}

impl std::fmt::Debug for SessionDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDialer")
            .field("client_key", &self.client_key)
            .finish()
    }
}

impl SessionDialer {
    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    /// Open a connection to `address` on the client's side
    pub async fn dial(
        &self,
        network: &str,
        address: &str,
        timeout: Duration,
    ) -> SessionResult<SessionConn> {
        let (session, via_peer) = self
            .server
            .route(&self.client_key)
            .ok_or_else(|| SessionError::NoSession(self.client_key.clone()))?;

        let mut request = ConnectRequest::new(network, address);
        if via_peer {
            request = request.for_client(&self.client_key);
        }

        session.dial(request, timeout).await
    }
}

/// Serves connect requests arriving from peers by dialing the local session
/// of the requested client
struct PeerForwarder {
    server: Weak<ServerInner>,
}

#[async_trait::async_trait]
impl ConnectHandler for PeerForwarder {
    async fn connect(&self, request: &ConnectRequest) -> io::Result<Box<dyn AsyncIo>> {
        let server = self
            .server
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "server shut down"))?;

        let client_key = request.client_key.as_deref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "peer connect without client key")
        })?;

        // Only local sessions: a forwarded dial never hops a second time
        let session = server.local_session(client_key).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no session for client {}", client_key),
            )
        })?;

        let conn = session
            .dial(
                ConnectRequest::new(&request.network, &request.address),
                server.config.dial_timeout,
            )
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        Ok(Box::new(conn))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn websocket_accept_key(headers: &HeaderMap) -> Option<String> {
    let is_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !is_websocket {
        return None;
    }

    headers
        .get(header::SEC_WEBSOCKET_KEY)
        .map(|key| derive_accept_key(key.as_bytes()))
}
