//! Session transport errors

use thiserror::Error;
use tunnelmesh_proto::FrameError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No session registered for client {0}")]
    NoSession(String),

    #[error("Session closed")]
    Closed,

    #[error("Dial to {address} timed out after {timeout_secs}s")]
    DialTimeout { address: String, timeout_secs: u64 },

    #[error("Dial to {address} failed: {reason}")]
    DialFailed { address: String, reason: String },

    #[error("Connection rejected by server: HTTP {0}")]
    Rejected(u16),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
