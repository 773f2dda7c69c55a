//! Tunnel manager errors

use thiserror::Error;
use tunnelmesh_session::SessionError;

use crate::discovery::DiscoveryError;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to route a request to a cluster; answered with 502
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("{0}")]
    Index(#[from] crate::indexer::IndexError),

    #[error("no session for cluster {0}")]
    NoSession(String),

    #[error("cluster {0} has not advertised a server address")]
    NoAddress(String),

    #[error("cluster {cluster_id} has invalid server address {address:?}: {reason}")]
    InvalidAddress {
        cluster_id: String,
        address: String,
        reason: String,
    },
}

/// Failure while forwarding a request to a backend; answered with 500
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid backend address {0:?}")]
    InvalidAddress(String),

    #[error("failed to build backend request: {0}")]
    Request(#[from] http::Error),

    #[error("backend request failed: {0}")]
    Backend(#[from] hyper_util::client::legacy::Error),
}

pub type ManagerResult<T> = Result<T, ManagerError>;
