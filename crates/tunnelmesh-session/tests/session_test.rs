//! End-to-end session tests over real sockets
//!
//! Each test runs one or two session servers behind axum, connects agents to
//! them and dials through the sessions to a local TCP echo server.

use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue};
use axum::routing::any;
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tunnelmesh_proto::headers;
use tunnelmesh_session::{
    dial, Admission, AuthorizeError, Authorizer, ConnectHandler, PeerCredentials, SessionConfig,
    SessionError, SessionServer, TcpConnectHandler,
};

const PEER_TOKEN: &str = "peer-secret";

#[derive(Default)]
struct HeaderAuthorizer {
    removed: Mutex<Vec<String>>,
    admitted: AtomicUsize,
}

impl Authorizer for HeaderAuthorizer {
    fn authorize(&self, headers: &HeaderMap) -> Result<Admission, AuthorizeError> {
        let token = headers
            .get(headers::TUNNEL_TOKEN)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if token != "agent-secret" {
            return Err(AuthorizeError::InvalidToken);
        }

        let id = headers
            .get(headers::TUNNEL_ID)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthorizeError::MissingHeader(headers::TUNNEL_ID))?;
        let address = headers
            .get(headers::DEFAULT_CLUSTER_ADDRESS)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        self.admitted.fetch_add(1, Ordering::SeqCst);
        Ok(Admission {
            client_key: id.to_string(),
            address,
        })
    }

    fn on_session_removed(&self, client_key: &str) {
        self.removed.lock().unwrap().push(client_key.to_string());
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tunnelmesh_session=debug")
        .with_test_writer()
        .try_init();
}

async fn start_server(peer_id: &str) -> (SessionServer, Arc<HeaderAuthorizer>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let authorizer = Arc::new(HeaderAuthorizer::default());
    let server = SessionServer::new(
        authorizer.clone(),
        PeerCredentials {
            peer_id: peer_id.to_string(),
            token: PEER_TOKEN.to_string(),
        },
        SessionConfig::default().with_peer_retry_interval(Duration::from_millis(100)),
    );

    let handler_server = server.clone();
    let app = Router::new().route(
        "/connect",
        any(move |request: Request| {
            let server = handler_server.clone();
            async move { server.serve_connect(request).await }
        }),
    );

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (server, authorizer, addr)
}

async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

fn agent_headers(id: &str, address: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(headers::TUNNEL_ID, HeaderValue::from_str(id).unwrap());
    headers.insert(headers::TUNNEL_TOKEN, HeaderValue::from_static("agent-secret"));
    if let Some(address) = address {
        headers.insert(
            headers::DEFAULT_CLUSTER_ADDRESS,
            HeaderValue::from_str(address).unwrap(),
        );
    }
    headers
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn connect_agent(addr: SocketAddr, id: &str, address: Option<&str>) -> tunnelmesh_session::Session {
    let handler: Arc<dyn ConnectHandler> = Arc::new(TcpConnectHandler);
    dial(
        &format!("ws://{}/connect", addr),
        &agent_headers(id, address),
        None,
        Some(handler),
        &SessionConfig::default(),
    )
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dial_through_agent_session() {
    init_tracing();

    let echo = start_echo().await;
    let (server, _, addr) = start_server("127.0.0.1:1").await;
    let _agent = connect_agent(addr, "c1", None).await;

    wait_until(|| server.has_session("c1")).await;
    assert_eq!(server.client_keys(), vec!["c1".to_string()]);

    let mut conn = server
        .dialer("c1")
        .dial("tcp", &echo.to_string(), Duration::from_secs(5))
        .await
        .unwrap();

    conn.write_all(b"hello through the tunnel").await.unwrap();
    let mut buf = [0u8; 24];
    timeout(Duration::from_secs(5), conn.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello through the tunnel");

    // Large payloads are split into several frames and reassembled
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    conn.write_all(&payload).await.unwrap();
    conn.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    timeout(Duration::from_secs(5), conn.read_to_end(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, payload);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unauthorized_agent_is_rejected() {
    init_tracing();

    let (server, authorizer, addr) = start_server("127.0.0.1:1").await;

    let mut headers = agent_headers("c1", None);
    headers.insert(headers::TUNNEL_TOKEN, HeaderValue::from_static("wrong"));

    let err = dial(
        &format!("ws://{}/connect", addr),
        &headers,
        None,
        None,
        &SessionConfig::default(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, SessionError::Rejected(401)));
    assert_eq!(authorizer.admitted.load(Ordering::SeqCst), 0);
    assert!(!server.has_session("c1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dial_to_unreachable_target_fails() {
    init_tracing();

    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let (server, _, addr) = start_server("127.0.0.1:1").await;
    let _agent = connect_agent(addr, "c1", None).await;
    wait_until(|| server.has_session("c1")).await;

    let err = server
        .dialer("c1")
        .dial("tcp", &closed.to_string(), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::DialFailed { .. }), "got {err:?}");

    let err = server
        .dialer("c1")
        .dial("udp", &closed.to_string(), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::DialFailed { .. }), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_removal_hook_runs_after_last_session() {
    init_tracing();

    let (server, authorizer, addr) = start_server("127.0.0.1:1").await;

    let first = connect_agent(addr, "c1", None).await;
    wait_until(|| authorizer.admitted.load(Ordering::SeqCst) == 1).await;
    let second = connect_agent(addr, "c1", None).await;
    wait_until(|| authorizer.admitted.load(Ordering::SeqCst) == 2).await;

    first.close();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server.has_session("c1"));
    assert!(authorizer.removed.lock().unwrap().is_empty());

    second.close();
    wait_until(|| !server.has_session("c1")).await;
    wait_until(|| !authorizer.removed.lock().unwrap().is_empty()).await;
    assert_eq!(*authorizer.removed.lock().unwrap(), vec!["c1".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dial_forwarded_through_peer() {
    init_tracing();

    let echo = start_echo().await;
    let (server_a, _, addr_a) = start_server("127.0.0.1:1001").await;
    let (server_b, _, addr_b) = start_server("127.0.0.1:1002").await;

    // The agent only connects to B; A reaches it through its peer session
    let _agent = connect_agent(addr_b, "c1", Some("10.0.0.5:9443")).await;
    wait_until(|| server_b.has_session("c1")).await;
    assert_eq!(
        server_b.advertised_address("c1").as_deref(),
        Some("10.0.0.5:9443")
    );

    server_a.add_peer(&format!("ws://{}/connect", addr_b), "127.0.0.1:1002", PEER_TOKEN);
    wait_until(|| server_a.has_session("c1")).await;
    assert!(server_a.client_keys().is_empty());
    assert_eq!(
        server_a.advertised_address("c1").as_deref(),
        Some("10.0.0.5:9443")
    );

    let mut conn = server_a
        .dialer("c1")
        .dial("tcp", &echo.to_string(), Duration::from_secs(5))
        .await
        .unwrap();
    conn.write_all(b"via peer").await.unwrap();
    let mut buf = [0u8; 8];
    timeout(Duration::from_secs(5), conn.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"via peer");

    server_a.remove_peer("127.0.0.1:1002");
    wait_until(|| !server_a.has_session("c1")).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peer_with_wrong_token_never_links() {
    init_tracing();

    let (server_a, _, _) = start_server("127.0.0.1:1001").await;
    let (server_b, _, addr_b) = start_server("127.0.0.1:1002").await;

    let _agent = connect_agent(addr_b, "c1", None).await;
    wait_until(|| server_b.has_session("c1")).await;
    assert_eq!(
        server_b.advertised_address("c1").as_deref(),
        Some("10.0.0.5:9443")
    );

    server_a.add_peer(&format!("ws://{}/connect", addr_b), "127.0.0.1:1002", "wrong-token");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!server_a.has_session("c1"));
    server_a.remove_peer("127.0.0.1:1002");
}
