//! Tunnel client against a real session server

use axum::extract::Request;
use axum::http::HeaderMap;
use axum::routing::any;
use axum::Router;
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tunnelmesh_client::{encode_registry, ClientMetrics, ClientOptions, TunnelClient};
use tunnelmesh_proto::headers;
use tunnelmesh_session::{
    Admission, AuthorizeError, Authorizer, PeerCredentials, SessionConfig, SessionServer,
};

/// Admits agents presenting `T`, after refusing the first `refusals` attempts
#[derive(Default)]
struct CountingAuthorizer {
    refusals: usize,
    attempts: AtomicUsize,
    addresses: Mutex<Vec<String>>,
    proxy_auth: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
}

impl Authorizer for CountingAuthorizer {
    fn authorize(&self, map: &HeaderMap) -> Result<Admission, AuthorizeError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.refusals {
            return Err(AuthorizeError::Denied("not yet".to_string()));
        }

        let read = |name: &str| {
            map.get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        if read(headers::TUNNEL_TOKEN).as_deref() != Some("T") {
            return Err(AuthorizeError::InvalidToken);
        }
        let client_key =
            read(headers::TUNNEL_ID).ok_or(AuthorizeError::MissingHeader(headers::TUNNEL_ID))?;
        let address = read(headers::DEFAULT_CLUSTER_ADDRESS);

        if let Some(address) = &address {
            self.addresses.lock().unwrap().push(address.clone());
        }
        if let Some(auth) = read("proxy-authorization") {
            self.proxy_auth.lock().unwrap().push(auth);
        }

        Ok(Admission {
            client_key,
            address,
        })
    }

    fn on_session_removed(&self, client_key: &str) {
        self.removed.lock().unwrap().push(client_key.to_string());
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tunnelmesh_client=debug,tunnelmesh_session=debug")
        .with_test_writer()
        .try_init();
}

async fn start_server(authorizer: Arc<CountingAuthorizer>) -> (SessionServer, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = SessionServer::new(
        authorizer,
        PeerCredentials {
            peer_id: addr.to_string(),
            token: "T".to_string(),
        },
        SessionConfig::default(),
    );

    let handler_server = server.clone();
    let app = Router::new().route(
        "/tunnel/connect",
        any(move |request: Request| {
            let server = handler_server.clone();
            async move { server.serve_connect(request).await }
        }),
    );

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (server, addr)
}

async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

fn options(server: SocketAddr, local_endpoint: &str, cancel: &CancellationToken) -> ClientOptions {
    ClientOptions::new(
        "c1",
        "T",
        format!("ws://{}/tunnel/connect", server),
        local_endpoint,
    )
    .with_tls_config(tunnelmesh_session::tls::client_config(None, false).unwrap())
    .with_cancellation(cancel.clone())
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_connects_and_serves_tcp() {
    init_tracing();

    let echo = start_echo().await;
    let authorizer = Arc::new(CountingAuthorizer::default());
    let (server, addr) = start_server(authorizer.clone()).await;

    let cancel = CancellationToken::new();
    let mut prom = Registry::default();
    let metrics = ClientMetrics::register(&mut prom);
    let client = TunnelClient::new(
        options(addr, &echo.to_string(), &cancel).with_proxy_token("p-1"),
        metrics.clone(),
    )
    .unwrap();
    let handle = client.start();

    wait_until(|| server.has_session("c1")).await;
    wait_until(|| metrics.connection_status() == 1).await;
    assert_eq!(*authorizer.addresses.lock().unwrap(), vec![echo.to_string()]);
    assert_eq!(*authorizer.proxy_auth.lock().unwrap(), vec!["Bearer p-1".to_string()]);

    let mut conn = server
        .dialer("c1")
        .dial("tcp", &echo.to_string(), Duration::from_secs(5))
        .await
        .unwrap();
    conn.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(5), conn.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");

    let text = encode_registry(&prom).unwrap();
    assert!(text.contains("tunnel_connection_status 1"));

    cancel.cancel();
    timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert_eq!(metrics.connection_status(), 0);

    wait_until(|| !authorizer.removed.lock().unwrap().is_empty()).await;
    assert!(!server.has_session("c1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_retries_until_admitted() {
    init_tracing();

    let authorizer = Arc::new(CountingAuthorizer {
        refusals: 3,
        ..Default::default()
    });
    let (server, addr) = start_server(authorizer.clone()).await;

    let cancel = CancellationToken::new();
    let metrics = ClientMetrics::default();
    let handle = TunnelClient::new(options(addr, "127.0.0.1:8080", &cancel), metrics.clone())
        .unwrap()
        .start();

    // The first five reconnects are immediate, so three refusals are cheap
    wait_until(|| server.has_session("c1")).await;
    assert_eq!(authorizer.attempts.load(Ordering::SeqCst), 4);
    assert_eq!(metrics.connection_attempts(), 3);

    cancel.cancel();
    timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_interrupts_retry_delay() {
    init_tracing();

    let authorizer = Arc::new(CountingAuthorizer {
        refusals: usize::MAX,
        ..Default::default()
    });
    let (_server, addr) = start_server(authorizer.clone()).await;

    let cancel = CancellationToken::new();
    let metrics = ClientMetrics::default();
    let handle = TunnelClient::new(options(addr, "127.0.0.1:8080", &cancel), metrics.clone())
        .unwrap()
        .start();

    // Five immediate retries, then the loop parks in the five second delay
    wait_until(|| metrics.connection_attempts() == 6).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(authorizer.attempts.load(Ordering::SeqCst), 6);
    assert_eq!(metrics.connection_status(), 0);

    cancel.cancel();
    timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
}

#[test]
fn test_missing_cancellation_is_rejected() {
    let mut options = ClientOptions::new("c1", "T", "ws://127.0.0.1:1/tunnel/connect", "127.0.0.1:8080")
        .with_tls_config(tunnelmesh_session::tls::client_config(None, false).unwrap());
    options.cancel = None;
    assert!(TunnelClient::new(options, ClientMetrics::default()).is_err());
}
