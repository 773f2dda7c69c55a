//! Connection metrics exported by the agent

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::error::ClientResult;

#[derive(Clone, Debug, Default)]
pub struct ClientMetrics {
    connection_status: Gauge,
    connection_attempts: Counter,
}

impl ClientMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();

        prom.register(
            "tunnel_connection_status",
            "Whether the tunnel session is connected (1) or not (0)",
            metrics.connection_status.clone(),
        );

        // Exposed as tunnel_connection_attempts_total
        prom.register(
            "tunnel_connection_attempts",
            "Count of completed tunnel connection attempts",
            metrics.connection_attempts.clone(),
        );

        metrics
    }

    pub fn set_connected(&self, connected: bool) {
        self.connection_status.set(i64::from(connected));
    }

    pub fn record_attempt(&self) {
        self.connection_attempts.inc();
    }

    pub fn connection_status(&self) -> i64 {
        self.connection_status.get()
    }

    pub fn connection_attempts(&self) -> u64 {
        self.connection_attempts.get()
    }
}

/// Text exposition of everything in `prom`
pub fn encode_registry(prom: &Registry) -> ClientResult<String> {
    let mut buffer = String::new();
    encode(&mut buffer, prom)?;
    Ok(buffer)
}
