//! tunnelmesh - reverse tunnels from clusters to a mesh of tunnel managers
//!
//! `tunnelmesh server` runs a tunnel manager: agents connect to it, and HTTP
//! requests it receives are proxied through the agent's session. Managers
//! link to each other so a request can land on any of them.
//!
//! `tunnelmesh agent` runs next to a cluster's local service and keeps a
//! session open to a manager.

mod config;

use anyhow::{bail, Context, Result};
use axum::routing::get;
use axum::Router;
use clap::{Args, Parser, Subcommand};
use prometheus_client::registry::Registry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tunnelmesh_client::{encode_registry, ClientMetrics, ClientOptions, TunnelClient};
use tunnelmesh_manager::serve::{serve_plain, serve_tls};
use tunnelmesh_manager::{
    HeaderIndexer, Indexer, PathIndexer, ServiceInstance, StaticDiscovery, TunnelManager,
    TunnelOptions,
};
use tunnelmesh_session::tls;

use crate::config::{AgentFileConfig, FileConfig, ServerFileConfig};

const PEER_SERVICE: &str = "tunnelmesh";
const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
const DEFAULT_INDEX_HEADER: &str = "x-cluster-id";

#[derive(Parser, Debug)]
#[command(name = "tunnelmesh")]
#[command(about = "Reverse tunnels from clusters to a mesh of tunnel managers", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// YAML config file; command line flags take precedence
    #[arg(long, short, global = true, env = "TUNNELMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). RUST_LOG overrides it.
    #[arg(long, global = true, env = "TUNNELMESH_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a tunnel manager
    Server(ServerArgs),
    /// Run an agent that connects a local service to a manager
    Agent(AgentArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Address to listen on for agents, peers and proxied requests
    #[arg(long, env = "TUNNELMESH_LISTEN")]
    listen: Option<String>,

    /// This instance's host:port as its peers reach it (defaults to --listen)
    #[arg(long, env = "TUNNELMESH_TUNNEL_ID")]
    tunnel_id: Option<String>,

    /// Shared token for agents, and for peers unless --peer-token is set
    #[arg(long, env = "TUNNELMESH_TOKEN")]
    token: Option<String>,

    /// Separate token for peer sessions
    #[arg(long, env = "TUNNELMESH_PEER_TOKEN")]
    peer_token: Option<String>,

    /// Peer instance host:port (repeatable)
    #[arg(long = "peer", env = "TUNNELMESH_PEERS", value_delimiter = ',')]
    peers: Vec<String>,

    /// Path of the session endpoint
    #[arg(long, env = "TUNNELMESH_CONNECT_URL")]
    connect_url: Option<String>,

    /// Header agents advertise their service address in
    #[arg(long, env = "TUNNELMESH_CLUSTER_ADDRESS_HEADER")]
    cluster_address_header: Option<String>,

    /// Route requests by this header's value
    #[arg(long, env = "TUNNELMESH_INDEX_HEADER")]
    index_header: Option<String>,

    /// Route requests by the first path segment after this prefix instead
    #[arg(long, env = "TUNNELMESH_INDEX_PATH_PREFIX")]
    index_path_prefix: Option<String>,

    /// Only proxy requests under this path
    #[arg(long, env = "TUNNELMESH_PROXY_PREFIX")]
    proxy_prefix: Option<String>,

    /// TLS certificate (PEM) for serving HTTPS
    #[arg(long, env = "TUNNELMESH_TLS_CERT")]
    tls_cert: Option<String>,

    /// TLS private key (PEM) for serving HTTPS
    #[arg(long, env = "TUNNELMESH_TLS_KEY")]
    tls_key: Option<String>,

    /// CA bundle (PEM) for https backends and wss peers
    #[arg(long, env = "TUNNELMESH_CA_FILE")]
    ca_file: Option<String>,

    /// Skip certificate verification for backends and peers (development only)
    #[arg(long, env = "TUNNELMESH_INSECURE")]
    insecure: bool,

    /// Dial peers over ws:// instead of wss://
    #[arg(long, env = "TUNNELMESH_PLAIN_PEERS")]
    plain_peers: bool,
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// Cluster identity presented to the manager
    #[arg(long, env = "TUNNELMESH_CLUSTER_ID")]
    cluster_id: Option<String>,

    /// Shared token
    #[arg(long, env = "TUNNELMESH_TOKEN")]
    token: Option<String>,

    /// Manager session endpoint (e.g. wss://tunnel.example.com/tunnel/connect)
    #[arg(long, env = "TUNNELMESH_PROXY")]
    proxy: Option<String>,

    /// host:port of the local service to expose
    #[arg(long, env = "TUNNELMESH_LOCAL_ENDPOINT")]
    local_endpoint: Option<String>,

    /// Bearer token for an authenticating proxy in front of the manager
    #[arg(long, env = "TUNNELMESH_PROXY_TOKEN")]
    proxy_token: Option<String>,

    /// Header the local endpoint is advertised in
    #[arg(long, env = "TUNNELMESH_CLUSTER_ADDRESS_HEADER")]
    cluster_address_header: Option<String>,

    /// CA bundle (PEM) for the manager's certificate
    #[arg(long, env = "TUNNELMESH_CA_FILE")]
    ca_file: Option<String>,

    /// Skip certificate verification (development only)
    #[arg(long, env = "TUNNELMESH_INSECURE")]
    insecure: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "TUNNELMESH_METRICS_ADDR")]
    metrics_addr: Option<String>,
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .context("Invalid log level")?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    Ok(())
}

fn required(value: Option<String>, flag: &str) -> Result<String> {
    match value {
        Some(value) if !value.is_empty() => Ok(value),
        _ => bail!("{} is required (flag, environment or config file)", flag),
    }
}

fn client_tls(ca_file: Option<&str>, insecure: bool) -> Result<Arc<rustls::ClientConfig>> {
    if insecure {
        warn!("Certificate verification disabled (insecure mode)");
    }
    tls::client_config(ca_file.map(Path::new), insecure).context("Failed to build TLS config")
}

async fn wait_for_shutdown(cancel: &CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Error listening for shutdown signal: {}", e),
        },
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();
}

async fn run_server(args: ServerArgs, file: ServerFileConfig) -> Result<()> {
    let listen = args
        .listen
        .or(file.listen)
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
    let tunnel_id = args.tunnel_id.or(file.tunnel_id).unwrap_or_else(|| listen.clone());
    let token = required(args.token.or(file.token), "--token")?;
    let peers = if args.peers.is_empty() {
        file.peers
    } else {
        args.peers
    };
    let insecure = args.insecure || file.insecure.unwrap_or(false);
    let plain_peers = args.plain_peers || file.plain_peers.unwrap_or(false);
    let ca_file = args.ca_file.or(file.ca_file);

    let indexer: Arc<dyn Indexer> = match args.index_path_prefix.or(file.index_path_prefix) {
        Some(prefix) => Arc::new(PathIndexer::new(prefix)),
        None => Arc::new(HeaderIndexer::new(
            args.index_header
                .or(file.index_header)
                .unwrap_or_else(|| DEFAULT_INDEX_HEADER.to_string()),
        )),
    };

    // Static peer list, including ourselves; the peer manager skips its own id
    let mut instances = vec![ServiceInstance::new(tunnel_id.clone(), tunnel_id.clone())];
    instances.extend(
        peers
            .iter()
            .map(|peer| ServiceInstance::new(peer.clone(), peer.clone())),
    );
    let discovery = StaticDiscovery::new().with_service(PEER_SERVICE, instances);

    let cancel = CancellationToken::new();
    let mut options = TunnelOptions::new(tunnel_id.clone(), token)
        .with_tls_config(client_tls(ca_file.as_deref(), insecure)?)
        .with_peer_discovery(PEER_SERVICE, Arc::new(discovery))
        .with_indexer(indexer)
        .with_secure_peers(!plain_peers)
        .with_shutdown(cancel.clone());
    if let Some(peer_token) = args.peer_token.or(file.peer_token) {
        options = options.with_peer_token(peer_token);
    }
    if let Some(connect_url) = args.connect_url.or(file.connect_url) {
        options = options.with_connect_url(connect_url);
    }
    if let Some(header) = args.cluster_address_header.or(file.cluster_address_header) {
        options = options.with_cluster_address_header(header);
    }
    if let Some(prefix) = args.proxy_prefix.or(file.proxy_prefix) {
        options = options.with_proxy_prefix(prefix);
    }

    let manager = TunnelManager::new(options).context("Invalid tunnel manager configuration")?;
    manager.start().context("Failed to start peer discovery")?;

    info!(
        tunnel_id = %tunnel_id,
        listen = %listen,
        peers = peers.len(),
        "Tunnel manager starting"
    );

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    let router = manager.router();

    let server = match (args.tls_cert.or(file.tls_cert), args.tls_key.or(file.tls_key)) {
        (Some(cert), Some(key)) => {
            let acceptor = tls::server_acceptor(Path::new(&cert), Path::new(&key))
                .context("Failed to load TLS certificate")?;
            tokio::spawn(serve_tls(listener, acceptor, router, cancel.clone()))
        }
        (None, None) => tokio::spawn(serve_plain(listener, router, cancel.clone())),
        _ => bail!("--tls-cert and --tls-key must be given together"),
    };

    wait_for_shutdown(&cancel).await;
    manager.shutdown();

    match server.await {
        Ok(Ok(())) => info!("Tunnel manager stopped"),
        Ok(Err(e)) => return Err(e).context("HTTP server failed"),
        Err(e) => return Err(e).context("HTTP server task panicked"),
    }
    Ok(())
}

async fn serve_metrics(
    addr: String,
    prom: Arc<Registry>,
    cancel: CancellationToken,
) -> Result<()> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let prom = prom.clone();
            async move {
                match encode_registry(&prom) {
                    Ok(text) => (axum::http::StatusCode::OK, text),
                    Err(e) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                }
            }
        }),
    );

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind metrics address {}", addr))?;
    info!(addr = %addr, "Serving metrics");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Metrics server failed")
}

async fn run_agent(args: AgentArgs, file: AgentFileConfig) -> Result<()> {
    let cluster_id = required(args.cluster_id.or(file.cluster_id), "--cluster-id")?;
    let token = required(args.token.or(file.token), "--token")?;
    let proxy = required(args.proxy.or(file.proxy), "--proxy")?;
    let local_endpoint = required(
        args.local_endpoint.or(file.local_endpoint),
        "--local-endpoint",
    )?;
    let insecure = args.insecure || file.insecure.unwrap_or(false);
    let ca_file = args.ca_file.or(file.ca_file);

    let cancel = CancellationToken::new();
    let mut options = ClientOptions::new(cluster_id.clone(), token, proxy.clone(), local_endpoint)
        .with_tls_config(client_tls(ca_file.as_deref(), insecure)?)
        .with_cancellation(cancel.clone());
    if let Some(proxy_token) = args.proxy_token.or(file.proxy_token) {
        options = options.with_proxy_token(proxy_token);
    }
    if let Some(header) = args.cluster_address_header.or(file.cluster_address_header) {
        options = options.with_cluster_address_header(header);
    }

    let mut prom = Registry::default();
    let metrics = ClientMetrics::register(&mut prom);
    let prom = Arc::new(prom);

    let client = TunnelClient::new(options, metrics).context("Invalid agent configuration")?;
    info!(cluster_id = %cluster_id, proxy = %proxy, "Agent starting");

    let metrics_task = args
        .metrics_addr
        .or(file.metrics_addr)
        .map(|addr| tokio::spawn(serve_metrics(addr, prom.clone(), cancel.clone())));

    let client_task = client.start();

    wait_for_shutdown(&cancel).await;

    if let Err(e) = client_task.await {
        error!("Agent task panicked: {}", e);
    }
    if let Some(task) = metrics_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{:#}", e),
            Err(e) => error!("Metrics task panicked: {}", e),
        }
    }

    info!("Agent stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    let log_level = cli
        .log_level
        .or(file.log_level)
        .unwrap_or_else(|| "info".to_string());
    setup_logging(&log_level)?;

    match cli.command {
        Commands::Server(args) => run_server(args, file.server).await,
        Commands::Agent(args) => run_agent(args, file.agent).await,
    }
}
