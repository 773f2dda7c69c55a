//! Session tuning knobs

use std::time::Duration;
use tunnelmesh_proto::DEFAULT_DIAL_TIMEOUT_SECS;

/// Per-session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between WebSocket ping frames
    pub keep_alive_interval: Duration,

    /// Capacity of the outbound data frame queue
    pub frame_queue_capacity: usize,

    /// Timeout for dials forwarded on behalf of peers
    pub dial_timeout: Duration,

    /// Delay between reconnect attempts of outbound peer sessions
    pub peer_retry_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(30),
            frame_queue_capacity: 256,
            dial_timeout: Duration::from_secs(DEFAULT_DIAL_TIMEOUT_SECS),
            peer_retry_interval: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// Set custom keep-alive interval
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set the timeout for forwarded dials
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the reconnect delay of outbound peer sessions
    pub fn with_peer_retry_interval(mut self, interval: Duration) -> Self {
        self.peer_retry_interval = interval;
        self
    }
}
