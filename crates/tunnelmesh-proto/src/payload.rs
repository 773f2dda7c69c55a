//! Structured frame payloads

use serde::{Deserialize, Serialize};

/// Request to open a connection on the far side of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Network of the target, e.g. "tcp"
    pub network: String,
    /// Target address as `host:port`
    pub address: String,
    /// Set when the request travels over a peer session: the far side must
    /// forward it to the session registered under this key.
    pub client_key: Option<String>,
}

impl ConnectRequest {
    pub fn new(network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            address: address.into(),
            client_key: None,
        }
    }

    pub fn tcp(address: impl Into<String>) -> Self {
        Self::new("tcp", address)
    }

    /// Route the request through a peer to the given client
    pub fn for_client(mut self, client_key: impl Into<String>) -> Self {
        self.client_key = Some(client_key.into());
        self
    }
}

/// Advertisement of a client reachable through a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAdvert {
    pub client_key: String,
    /// Address the client advertised when it was admitted
    pub address: Option<String>,
}
