//! Error types for the tunnel client

use thiserror::Error;
use tunnelmesh_session::SessionError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Metrics encoding failed: {0}")]
    Metrics(#[from] std::fmt::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;
