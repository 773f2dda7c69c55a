//! Multiplexed sessions over a single WebSocket
//!
//! Each session runs two tasks: a reader that decodes frames and routes them
//! to virtual connections, and a writer that drains the outbound queues onto
//! the socket. Advertisement frames use an unbounded control queue so they
//! are never stuck behind connection data; everything that belongs to a
//! connection travels on one bounded queue to keep per-connection ordering.
//!
//! The reader never waits on a single connection. Inbound data is bounded
//! by each connection's credit window instead, and a far side that sends
//! past its window has that connection reset.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use tunnelmesh_proto::{ClientAdvert, ConnId, ConnectRequest, Frame, FrameKind};

use crate::config::SessionConfig;
use crate::conn::{ConnEvent, ConnTable, SessionConn};
use crate::error::{SessionError, SessionResult};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

const WINDOW_EXCEEDED: &str = "receive window exceeded";

/// Byte stream returned by a [`ConnectHandler`]
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

/// Serves connect requests arriving from the far side of a session
#[async_trait]
pub trait ConnectHandler: Send + Sync {
    async fn connect(&self, request: &ConnectRequest) -> io::Result<Box<dyn AsyncIo>>;
}

/// Opens plain TCP connections. Any other network is refused.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnectHandler;

#[async_trait]
impl ConnectHandler for TcpConnectHandler {
    async fn connect(&self, request: &ConnectRequest) -> io::Result<Box<dyn AsyncIo>> {
        if request.network != "tcp" {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("network {} is not permitted", request.network),
            ));
        }

        let stream = TcpStream::connect(&request.address).await?;
        stream.set_nodelay(true)?;
        debug!(address = %request.address, "Opened TCP connection for session");
        Ok(Box::new(stream))
    }
}

/// One end of a multiplexed WebSocket session
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: u64,
    client_key: String,
    frames: mpsc::Sender<Frame>,
    control: mpsc::UnboundedSender<Frame>,
    conns: Arc<ConnTable>,
    next_conn_id: AtomicU64,
    remote_clients: RwLock<HashMap<String, Option<String>>>,
    closed: CancellationToken,
    established_at: Instant,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("client_key", &self.inner.client_key)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Start a session over an established WebSocket.
    ///
    /// `role` decides the connection id space: the server side of the
    /// WebSocket allocates even ids, the client side odd ids. Connect
    /// requests from the far side are refused unless a `handler` is given.
    pub fn spawn<S>(
        ws: WebSocketStream<S>,
        role: Role,
        client_key: impl Into<String>,
        config: &SessionConfig,
        handler: Option<Arc<dyn ConnectHandler>>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = ws.split();
        let (frame_tx, frame_rx) = mpsc::channel(config.frame_queue_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let first_conn_id = match role {
            Role::Server => 2,
            Role::Client => 1,
        };

        let session = Self {
            inner: Arc::new(SessionInner {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                client_key: client_key.into(),
                frames: frame_tx,
                control: control_tx,
                conns: Arc::new(ConnTable::default()),
                next_conn_id: AtomicU64::new(first_conn_id),
                remote_clients: RwLock::new(HashMap::new()),
                closed: CancellationToken::new(),
                established_at: Instant::now(),
            }),
        };

        tokio::spawn(write_loop(
            sink,
            frame_rx,
            control_rx,
            config.keep_alive_interval,
            session.inner.closed.clone(),
            session.inner.id,
        ));
        tokio::spawn(read_loop(source, session.clone(), handler));

        session
    }

    /// Process-unique session id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Key this session was registered under
    pub fn client_key(&self) -> &str {
        &self.inner.client_key
    }

    pub fn uptime(&self) -> Duration {
        self.inner.established_at.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the session has terminated
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Tear the session down
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    /// Number of open virtual connections
    pub fn active_connections(&self) -> usize {
        self.inner.conns.len()
    }

    /// Open a connection to `request.address` on the far side
    pub async fn dial(
        &self,
        request: ConnectRequest,
        timeout: Duration,
    ) -> SessionResult<SessionConn> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let conn_id = self.inner.next_conn_id.fetch_add(2, Ordering::Relaxed);
        let mut conn = self.register_conn(conn_id);
        let address = request.address.clone();

        let frame = Frame::connect(conn_id, &request)?;
        self.inner
            .frames
            .send(frame)
            .await
            .map_err(|_| SessionError::Closed)?;

        trace!(session_id = self.inner.id, conn_id, %address, "Dialing through session");

        // Dropping `conn` on failure unregisters it and tells the far side
        let outcome = tokio::time::timeout(timeout, conn.wait_connected()).await;
        match outcome {
            Ok(Ok(())) => Ok(conn),
            Ok(Err(reason)) => Err(SessionError::DialFailed { address, reason }),
            Err(_) => Err(SessionError::DialTimeout {
                address,
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    /// Advertise a client reachable through this end
    pub fn advertise_client(&self, advert: &ClientAdvert) -> SessionResult<()> {
        self.send_control(Frame::add_client(advert)?)
    }

    /// Withdraw a previously advertised client
    pub fn withdraw_client(&self, advert: &ClientAdvert) -> SessionResult<()> {
        self.send_control(Frame::remove_client(advert)?)
    }

    /// Whether the far side advertised `client_key`
    pub fn has_remote_client(&self, client_key: &str) -> bool {
        self.inner
            .remote_clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(client_key)
    }

    /// Address the far side advertised for `client_key`.
    ///
    /// `None` if the client is unknown; `Some(None)` if it is known but
    /// carried no address.
    pub fn remote_client_address(&self, client_key: &str) -> Option<Option<String>> {
        self.inner
            .remote_clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_key)
            .cloned()
    }

    pub fn remote_clients(&self) -> Vec<String> {
        self.inner
            .remote_clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn send_control(&self, frame: Frame) -> SessionResult<()> {
        self.inner
            .control
            .send(frame)
            .map_err(|_| SessionError::Closed)
    }

    fn register_conn(&self, conn_id: ConnId) -> SessionConn {
        SessionConn::open(conn_id, self.inner.frames.clone(), self.inner.conns.clone())
    }

    fn dispatch(&self, frame: Frame, handler: Option<&Arc<dyn ConnectHandler>>) {
        let conn_id = frame.conn_id;

        match frame.kind {
            FrameKind::Data => self.deliver(conn_id, frame.payload),
            FrameKind::Connected => self.notify(conn_id, ConnEvent::Connected),
            FrameKind::Fin => self.notify(conn_id, ConnEvent::Eof),
            FrameKind::Window => match frame.window_credit() {
                Ok(credit) => {
                    if let Some(slot) = self.inner.conns.get(conn_id) {
                        slot.grant(credit as usize);
                    }
                }
                Err(e) => warn!(session_id = self.inner.id, conn_id, error = %e, "Bad window frame"),
            },
            FrameKind::Close => {
                if let Some(slot) = self.inner.conns.remove(conn_id) {
                    slot.close(frame.close_reason());
                }
            }
            FrameKind::Connect => self.accept(frame, handler),
            FrameKind::AddClient => match frame.client_advert() {
                Ok(advert) => {
                    debug!(session_id = self.inner.id, client_key = %advert.client_key, "Remote client advertised");
                    self.inner
                        .remote_clients
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(advert.client_key, advert.address);
                }
                Err(e) => warn!(session_id = self.inner.id, error = %e, "Bad client advert"),
            },
            FrameKind::RemoveClient => match frame.client_advert() {
                Ok(advert) => {
                    debug!(session_id = self.inner.id, client_key = %advert.client_key, "Remote client withdrawn");
                    self.inner
                        .remote_clients
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&advert.client_key);
                }
                Err(e) => warn!(session_id = self.inner.id, error = %e, "Bad client withdrawal"),
            },
        }
    }

    fn deliver(&self, conn_id: ConnId, data: Bytes) {
        let Some(slot) = self.inner.conns.get(conn_id) else {
            trace!(conn_id, "Data for unknown connection");
            return;
        };
        if slot.deliver(data) {
            return;
        }

        warn!(session_id = self.inner.id, conn_id, "Connection overran its receive window, resetting");
        self.inner.conns.remove(conn_id);
        slot.close(Some(WINDOW_EXCEEDED.to_string()));
        let _ = self.send_control(Frame::close(conn_id, Some(WINDOW_EXCEEDED)));
    }

    fn notify(&self, conn_id: ConnId, event: ConnEvent) {
        match self.inner.conns.get(conn_id) {
            Some(slot) => slot.notify(event),
            None => trace!(conn_id, ?event, "Event for unknown connection"),
        }
    }

    fn accept(&self, frame: Frame, handler: Option<&Arc<dyn ConnectHandler>>) {
        let conn_id = frame.conn_id;
        let conn = self.register_conn(conn_id);

        let Some(handler) = handler.cloned() else {
            warn!(session_id = self.inner.id, conn_id, "Connect request on a session that accepts none");
            conn.abort("connections not accepted");
            return;
        };

        let request = match frame.connect_request() {
            Ok(request) => request,
            Err(e) => {
                conn.abort(&e.to_string());
                return;
            }
        };

        let session_id = self.inner.id;
        tokio::spawn(async move {
            let mut conn = conn;
            match handler.connect(&request).await {
                Ok(mut target) => {
                    if conn.acknowledge().await.is_err() {
                        return;
                    }
                    match tokio::io::copy_bidirectional(&mut conn, &mut target).await {
                        Ok((to_target, from_target)) => {
                            trace!(session_id, conn_id, to_target, from_target, "Connection finished")
                        }
                        Err(e) => debug!(session_id, conn_id, error = %e, "Connection ended with error"),
                    }
                }
                Err(e) => {
                    debug!(session_id, conn_id, address = %request.address, error = %e, "Connect request failed");
                    conn.abort(&e.to_string());
                }
            }
        });
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut frames: mpsc::Receiver<Frame>,
    mut control: mpsc::UnboundedReceiver<Frame>,
    keep_alive: Duration,
    closed: CancellationToken,
    session_id: u64,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut ping = tokio::time::interval(keep_alive);
    ping.tick().await;

    loop {
        let message = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            Some(frame) = control.recv() => Message::Binary(frame.encode()),
            Some(frame) = frames.recv() => Message::Binary(frame.encode()),
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        if let Err(e) = sink.send(message).await {
            debug!(session_id, error = %e, "Session write failed");
            break;
        }
    }

    closed.cancel();
    let _ = sink.close().await;
    debug!(session_id, "Session writer stopped");
}

async fn read_loop<S>(
    mut source: SplitStream<WebSocketStream<S>>,
    session: Session,
    handler: Option<Arc<dyn ConnectHandler>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let closed = session.inner.closed.clone();

    loop {
        let message = tokio::select! {
            _ = closed.cancelled() => break,
            message = source.next() => message,
        };

        match message {
            Some(Ok(Message::Binary(data))) => match Frame::decode(&data) {
                Ok(frame) => session.dispatch(frame, handler.as_ref()),
                Err(e) => warn!(session_id = session.inner.id, error = %e, "Dropping undecodable frame"),
            },
            Some(Ok(Message::Close(frame))) => {
                debug!(session_id = session.inner.id, ?frame, "Session closed by peer");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(session_id = session.inner.id, error = %e, "Session read failed");
                break;
            }
            None => break,
        }
    }

    closed.cancel();
    for slot in session.inner.conns.drain() {
        slot.close(Some("session closed".to_string()));
    }
    debug!(session_id = session.inner.id, "Session reader stopped");
}
