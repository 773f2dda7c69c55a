//! Agent side of the tunnel: a persistent session to the manager

use http::HeaderMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunnelmesh_session::{ConnectHandler, Session, SessionConfig, TcpConnectHandler};

use crate::backoff::ReconnectBackoff;
use crate::error::{ClientError, ClientResult};
use crate::metrics::ClientMetrics;
use crate::options::ClientOptions;

/// Keeps one session to the manager alive until cancelled.
///
/// Connect requests arriving over the session are dialed as plain TCP from
/// this host; other networks are refused.
pub struct TunnelClient {
    options: ClientOptions,
    headers: HeaderMap,
    cancel: CancellationToken,
    metrics: ClientMetrics,
    session_config: SessionConfig,
}

impl TunnelClient {
    pub fn new(options: ClientOptions, metrics: ClientMetrics) -> ClientResult<Self> {
        options.validate()?;
        let headers = options.connect_headers()?;
        let cancel = options
            .cancel
            .clone()
            .ok_or_else(|| ClientError::Config("a cancellation token is required".to_string()))?;

        Ok(Self {
            options,
            headers,
            cancel,
            metrics,
            session_config: SessionConfig::default(),
        })
    }

    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    pub fn metrics(&self) -> &ClientMetrics {
        &self.metrics
    }

    /// Spawn the connect loop. It ends when the cancellation token fires.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let handler: Arc<dyn ConnectHandler> = Arc::new(TcpConnectHandler);
        let tls = self
            .options
            .proxy_address
            .starts_with("wss://")
            .then(|| self.options.tls_config.clone())
            .flatten();
        let mut backoff = ReconnectBackoff::new();

        info!(
            cluster_id = %self.options.cluster_id,
            proxy = %self.options.proxy_address,
            local_endpoint = %self.options.local_endpoint,
            "Starting tunnel client"
        );

        while !self.cancel.is_cancelled() {
            backoff.record_attempt(Instant::now());
            self.metrics.set_connected(false);

            let dialed = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = tunnelmesh_session::dial(
                    &self.options.proxy_address,
                    &self.headers,
                    tls.clone(),
                    Some(handler.clone()),
                    &self.session_config,
                ) => result,
            };

            match dialed {
                Ok(session) => {
                    if self.hold(session).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        cluster_id = %self.options.cluster_id,
                        error = %e,
                        "Failed to connect to tunnel manager"
                    );
                }
            }

            self.metrics.set_connected(false);
            self.metrics.record_attempt();

            let delay = backoff.next_delay(Instant::now());
            if !delay.is_zero() {
                debug!(delay_secs = delay.as_secs(), "Waiting before reconnecting");
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        self.metrics.set_connected(false);
        info!(cluster_id = %self.options.cluster_id, "Tunnel client stopped");
    }

    /// Wait for the session to end. Returns true when cancelled.
    async fn hold(&self, session: Session) -> bool {
        self.metrics.set_connected(true);
        info!(cluster_id = %self.options.cluster_id, "Connected to tunnel manager");

        tokio::select! {
            _ = self.cancel.cancelled() => {
                session.close();
                true
            }
            _ = session.closed() => {
                info!(
                    cluster_id = %self.options.cluster_id,
                    uptime_secs = session.uptime().as_secs(),
                    "Session to tunnel manager ended"
                );
                false
            }
        }
    }
}
