//! End-to-end tests: agent → manager → backend over real sockets

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tunnelmesh_manager::serve::serve_plain;
use tunnelmesh_manager::{
    HeaderIndexer, ServiceInstance, StaticDiscovery, TunnelManager, TunnelOptions,
};
use tunnelmesh_proto::headers;
use tunnelmesh_session::{ConnectHandler, Session, SessionConfig, TcpConnectHandler};

const TOKEN: &str = "T";
const CONNECT_URL: &str = "/tunnel/connect";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tunnelmesh_manager=debug,tunnelmesh_session=debug")
        .with_test_writer()
        .try_init();
}

async fn start_backend(name: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = Router::new()
        .route(
            "/api/ping",
            get(move || async move { format!("pong from {}", name) }),
        )
        .route(
            "/ws",
            get(|ws: WebSocketUpgrade| async move {
                ws.on_upgrade(|mut socket| async move {
                    while let Some(Ok(message)) = socket.recv().await {
                        if socket.send(message).await.is_err() {
                            break;
                        }
                    }
                })
            }),
        );

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

struct RunningManager {
    manager: TunnelManager,
    addr: SocketAddr,
    cancel: CancellationToken,
}

async fn start_manager(listener: TcpListener, discovery: StaticDiscovery) -> RunningManager {
    start_manager_with(listener, discovery, |options| options).await
}

async fn start_manager_with(
    listener: TcpListener,
    discovery: StaticDiscovery,
    configure: impl FnOnce(TunnelOptions) -> TunnelOptions,
) -> RunningManager {
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();

    let options = TunnelOptions::new(addr.to_string(), TOKEN)
        .with_connect_url(CONNECT_URL)
        .with_tls_config(tunnelmesh_session::tls::client_config(None, false).unwrap())
        .with_peer_discovery("tunnel", Arc::new(discovery))
        .with_indexer(Arc::new(HeaderIndexer::new("x-cluster-id")))
        .with_secure_peers(false)
        .with_peer_retry_interval(Duration::from_millis(100))
        .with_shutdown(cancel.clone());

    let manager = TunnelManager::new(configure(options)).unwrap();
    manager.start().unwrap();

    let router = manager.router();
    let serve_cancel = cancel.clone();
    tokio::spawn(async move {
        serve_plain(listener, router, serve_cancel).await.unwrap();
    });

    RunningManager {
        manager,
        addr,
        cancel,
    }
}

async fn connect_agent(manager: SocketAddr, cluster_id: &str, address: &str) -> Session {
    let mut map = HeaderMap::new();
    map.insert(headers::TUNNEL_ID, HeaderValue::from_str(cluster_id).unwrap());
    map.insert(headers::TUNNEL_TOKEN, HeaderValue::from_static(TOKEN));
    map.insert(
        headers::DEFAULT_CLUSTER_ADDRESS,
        HeaderValue::from_str(address).unwrap(),
    );

    let handler: Arc<dyn ConnectHandler> = Arc::new(TcpConnectHandler);
    tunnelmesh_session::dial(
        &format!("ws://{}{}", manager, CONNECT_URL),
        &map,
        None,
        Some(handler),
        &SessionConfig::default(),
    )
    .await
    .unwrap()
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

async fn get_with_cluster(manager: SocketAddr, cluster_id: Option<&str>, path: &str) -> (StatusCode, String) {
    let client = Client::builder(TokioExecutor::new()).build_http::<Body>();

    let mut request = Request::builder().uri(format!("http://{}{}", manager, path));
    if let Some(cluster_id) = cluster_id {
        request = request.header("x-cluster-id", cluster_id);
    }
    let response = timeout(
        Duration::from_secs(10),
        client.request(request.body(Body::empty()).unwrap()),
    )
    .await
    .unwrap()
    .unwrap();

    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_request_proxied_to_registered_cluster() {
    init_tracing();

    let backend = start_backend("c1").await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let running = start_manager(listener, StaticDiscovery::new()).await;

    let _agent = connect_agent(running.addr, "c1", &backend.to_string()).await;
    wait_until(|| running.manager.sessions().has_session("c1")).await;

    let info = running.manager.registry().get("c1").unwrap();
    assert_eq!(info.server_address, backend.to_string());
    assert_eq!(running.manager.registry().len(), 1);

    let (status, body) = get_with_cluster(running.addr, Some("c1"), "/api/ping").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "pong from c1");

    let (status, _) = get_with_cluster(running.addr, Some("c2"), "/api/ping").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    let (status, body) = get_with_cluster(running.addr, None, "/api/ping").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body.contains("x-cluster-id"));

    running.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconnect_with_new_address_rebuilds_transport() {
    init_tracing();

    let first_backend = start_backend("first").await;
    let second_backend = start_backend("second").await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let running = start_manager(listener, StaticDiscovery::new()).await;

    let agent = connect_agent(running.addr, "c1", &first_backend.to_string()).await;
    wait_until(|| running.manager.sessions().has_session("c1")).await;

    let (_, body) = get_with_cluster(running.addr, Some("c1"), "/api/ping").await;
    assert_eq!(body, "pong from first");
    let first_generation = running
        .manager
        .registry()
        .get("c1")
        .and_then(|info| info.transport)
        .map(|transport| transport.generation())
        .unwrap();

    // A second session with a new address replaces the first
    let _replacement = connect_agent(running.addr, "c1", &second_backend.to_string()).await;
    wait_until(|| {
        running
            .manager
            .registry()
            .get("c1")
            .is_some_and(|info| info.server_address == second_backend.to_string())
    })
    .await;
    assert!(running.manager.registry().get("c1").unwrap().transport.is_none());
    agent.close();

    let (status, body) = get_with_cluster(running.addr, Some("c1"), "/api/ping").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "pong from second");

    let second_generation = running
        .manager
        .registry()
        .get("c1")
        .and_then(|info| info.transport)
        .map(|transport| transport.generation())
        .unwrap();
    assert_ne!(first_generation, second_generation);

    running.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cluster_evicted_when_agent_leaves() {
    init_tracing();

    let backend = start_backend("c1").await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let running = start_manager(listener, StaticDiscovery::new()).await;

    let agent = connect_agent(running.addr, "c1", &backend.to_string()).await;
    wait_until(|| running.manager.sessions().has_session("c1")).await;
    assert_eq!(running.manager.registry().len(), 1);

    agent.close();
    wait_until(|| running.manager.registry().is_empty()).await;

    let (status, _) = get_with_cluster(running.addr, Some("c1"), "/api/ping").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    running.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_websocket_upgrade_passes_through() {
    init_tracing();

    let backend = start_backend("c1").await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let running = start_manager(listener, StaticDiscovery::new()).await;

    let _agent = connect_agent(running.addr, "c1", &backend.to_string()).await;
    wait_until(|| running.manager.sessions().has_session("c1")).await;

    let mut request = format!("ws://{}/ws", running.addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("x-cluster-id", HeaderValue::from_static("c1"));

    let (mut ws, response) = timeout(
        Duration::from_secs(10),
        tokio_tungstenite::connect_async(request),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);

    ws.send(Message::Text("through the tunnel".to_string()))
        .await
        .unwrap();
    let echoed = timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(echoed, Message::Text("through the tunnel".to_string()));

    running.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_request_routed_through_peer() {
    init_tracing();

    let backend = start_backend("c1").await;

    let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr_a = listener_a.local_addr().unwrap();
    let addr_b = listener_b.local_addr().unwrap();

    let discovery = StaticDiscovery::new().with_service(
        "tunnel",
        vec![
            ServiceInstance::new("a", addr_a.to_string()),
            ServiceInstance::new("b", addr_b.to_string()),
        ],
    );

    let a = start_manager(listener_a, discovery.clone()).await;
    let b = start_manager(listener_b, discovery.clone()).await;

    wait_until(|| a.manager.peer_manager().is_ready() && b.manager.peer_manager().is_ready()).await;
    assert_eq!(a.manager.peer_manager().peers(), vec![addr_b.to_string()]);
    assert_eq!(b.manager.peer_manager().peers(), vec![addr_a.to_string()]);

    // The agent only knows B
    let _agent = connect_agent(b.addr, "c1", &backend.to_string()).await;
    wait_until(|| a.manager.sessions().has_session("c1")).await;
    assert!(a.manager.registry().get("c1").is_none());

    let (status, body) = get_with_cluster(a.addr, Some("c1"), "/api/ping").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "pong from c1");
    assert_eq!(
        a.manager.registry().get("c1").unwrap().server_address,
        backend.to_string()
    );

    // Dropping B from discovery unlinks it
    discovery.set_instances("tunnel", vec![ServiceInstance::new("a", addr_a.to_string())]);
    wait_until(|| a.manager.peer_manager().peers().is_empty()).await;
    wait_until(|| !a.manager.sessions().has_session("c1")).await;

    a.cancel.cancel();
    b.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_peer_routed_cluster_follows_new_address() {
    init_tracing();

    let first_backend = start_backend("first").await;
    let second_backend = start_backend("second").await;

    let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr_a = listener_a.local_addr().unwrap();
    let addr_b = listener_b.local_addr().unwrap();

    let discovery = StaticDiscovery::new().with_service(
        "tunnel",
        vec![
            ServiceInstance::new("a", addr_a.to_string()),
            ServiceInstance::new("b", addr_b.to_string()),
        ],
    );

    let a = start_manager(listener_a, discovery.clone()).await;
    let b = start_manager(listener_b, discovery).await;
    wait_until(|| a.manager.peer_manager().is_ready() && b.manager.peer_manager().is_ready()).await;

    let agent = connect_agent(b.addr, "c1", &first_backend.to_string()).await;
    wait_until(|| a.manager.sessions().has_session("c1")).await;

    let (status, body) = get_with_cluster(a.addr, Some("c1"), "/api/ping").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "pong from first");

    // The agent moves its backend and reconnects to B
    agent.close();
    wait_until(|| !a.manager.sessions().has_session("c1")).await;
    let _agent = connect_agent(b.addr, "c1", &second_backend.to_string()).await;
    wait_until(|| {
        a.manager.sessions().advertised_address("c1") == Some(second_backend.to_string())
    })
    .await;

    let (status, body) = get_with_cluster(a.addr, Some("c1"), "/api/ping").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "pong from second");
    assert_eq!(
        a.manager.registry().get("c1").unwrap().server_address,
        second_backend.to_string()
    );

    a.cancel.cancel();
    b.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_agent_with_wrong_token_is_refused() {
    init_tracing();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let running = start_manager(listener, StaticDiscovery::new()).await;

    let mut map = HeaderMap::new();
    map.insert(headers::TUNNEL_ID, HeaderValue::from_static("c1"));
    map.insert(headers::TUNNEL_TOKEN, HeaderValue::from_static("nope"));

    let err = tunnelmesh_session::dial(
        &format!("ws://{}{}", running.addr, CONNECT_URL),
        &map,
        None,
        None,
        &SessionConfig::default(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, tunnelmesh_session::SessionError::Rejected(401)));
    assert!(running.manager.registry().is_empty());

    running.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_agent_token_cannot_open_peer_session() {
    init_tracing();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let running = start_manager_with(listener, StaticDiscovery::new(), |options| {
        options.with_peer_token("peers-only")
    })
    .await;

    let peer_headers = |token: &'static str| {
        let mut map = HeaderMap::new();
        map.insert(headers::TUNNEL_PEER_ID, HeaderValue::from_static("10.9.9.9:8080"));
        map.insert(headers::TUNNEL_TOKEN, HeaderValue::from_static(token));
        map
    };
    let url = format!("ws://{}{}", running.addr, CONNECT_URL);

    let err = tunnelmesh_session::dial(&url, &peer_headers(TOKEN), None, None, &SessionConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, tunnelmesh_session::SessionError::Rejected(401)));

    let peer = tunnelmesh_session::dial(
        &url,
        &peer_headers("peers-only"),
        None,
        None,
        &SessionConfig::default(),
    )
    .await
    .unwrap();
    assert!(!peer.is_closed());

    // Agents still use the tunnel token
    let backend = start_backend("c1").await;
    let _agent = connect_agent(running.addr, "c1", &backend.to_string()).await;
    wait_until(|| running.manager.sessions().has_session("c1")).await;

    running.cancel.cancel();
}
