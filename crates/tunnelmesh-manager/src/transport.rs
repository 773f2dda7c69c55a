//! Pooled HTTP transport over session-dialed connections

use axum::body::Body;
use http::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::{Client, ResponseFuture};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use tunnelmesh_session::{SessionConn, SessionDialer};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// HTTP client whose connections are dialed through a cluster's session.
///
/// Clones share one connection pool. Dropping every clone closes the idle
/// connections.
#[derive(Clone)]
pub struct BackendTransport {
    generation: u64,
    client: Client<SessionConnector, Body>,
}

impl std::fmt::Debug for BackendTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendTransport")
            .field("generation", &self.generation)
            .finish()
    }
}

impl BackendTransport {
    pub fn new(
        dialer: SessionDialer,
        tls: Option<Arc<rustls::ClientConfig>>,
        dial_timeout: Duration,
        max_idle_per_host: usize,
    ) -> Self {
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        debug!(
            cluster_id = %dialer.client_key(),
            generation,
            "Building backend transport"
        );

        let connector = SessionConnector {
            dialer,
            tls: tls.map(TlsConnector::from),
            dial_timeout,
        };
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(max_idle_per_host)
            .build(connector);

        Self { generation, client }
    }

    /// Unique id of this transport; a rebuilt transport gets a new one
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn request(&self, request: http::Request<Body>) -> ResponseFuture {
        self.client.request(request)
    }
}

/// Connector that opens backend connections through the cluster's session
#[derive(Clone)]
pub struct SessionConnector {
    dialer: SessionDialer,
    tls: Option<TlsConnector>,
    dial_timeout: Duration,
}

impl tower::Service<Uri> for SessionConnector {
    type Response = BackendIo;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<BackendIo, io::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            let host = uri
                .host()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "backend uri has no host"))?
                .to_string();
            let https = uri.scheme_str() == Some("https");
            let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
            let address = format!("{}:{}", host, port);

            let conn = this
                .dialer
                .dial("tcp", &address, this.dial_timeout)
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e))?;

            if !https {
                return Ok(BackendIo::new(BackendConn::Plain(conn)));
            }

            let tls = this.tls.ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "https backend without a TLS client config",
                )
            })?;
            let server_name = ServerName::try_from(host.trim_matches(|c| c == '[' || c == ']').to_string())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let stream = tls.connect(server_name, conn).await?;

            Ok(BackendIo::new(BackendConn::Tls(Box::new(stream))))
        })
    }
}

/// A backend connection, optionally TLS-wrapped
pub enum BackendConn {
    Plain(SessionConn),
    Tls(Box<TlsStream<SessionConn>>),
}

impl AsyncRead for BackendConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendConn::Plain(conn) => Pin::new(conn).poll_read(cx, buf),
            BackendConn::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BackendConn::Plain(conn) => Pin::new(conn).poll_write(cx, buf),
            BackendConn::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendConn::Plain(conn) => Pin::new(conn).poll_flush(cx),
            BackendConn::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendConn::Plain(conn) => Pin::new(conn).poll_shutdown(cx),
            BackendConn::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// hyper I/O adapter for [`BackendConn`]
pub struct BackendIo {
    inner: TokioIo<BackendConn>,
}

impl BackendIo {
    fn new(conn: BackendConn) -> Self {
        Self {
            inner: TokioIo::new(conn),
        }
    }
}

impl hyper::rt::Read for BackendIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl hyper::rt::Write for BackendIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Connection for BackendIo {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}
