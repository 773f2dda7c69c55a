//! Tunnel client configuration

use http::header::PROXY_AUTHORIZATION;
use http::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tunnelmesh_proto::headers;

use crate::error::{ClientError, ClientResult};

/// Configuration of a [`crate::TunnelClient`]
#[derive(Clone, Default)]
pub struct ClientOptions {
    /// Identity presented to the manager
    pub cluster_id: String,
    pub token: String,
    /// Session endpoint of the manager, `ws://` or `wss://`
    pub proxy_address: String,
    /// `host:port` of the local service the manager should reach
    pub local_endpoint: String,
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    /// Sent as a bearer `Proxy-Authorization` when set
    pub proxy_token: Option<String>,
    pub cluster_address_header: String,
    pub cancel: Option<CancellationToken>,
}

impl ClientOptions {
    pub fn new(
        cluster_id: impl Into<String>,
        token: impl Into<String>,
        proxy_address: impl Into<String>,
        local_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            token: token.into(),
            proxy_address: proxy_address.into(),
            local_endpoint: local_endpoint.into(),
            cluster_address_header: headers::DEFAULT_CLUSTER_ADDRESS.to_string(),
            ..Default::default()
        }
    }

    pub fn with_tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    pub fn with_proxy_token(mut self, token: impl Into<String>) -> Self {
        self.proxy_token = Some(token.into());
        self
    }

    pub fn with_cluster_address_header(mut self, header: impl Into<String>) -> Self {
        self.cluster_address_header = header.into();
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Check required fields, stopping at the first one missing
    pub fn validate(&self) -> ClientResult<()> {
        if self.cancel.is_none() {
            return Err(ClientError::Config(
                "a cancellation token is required".to_string(),
            ));
        }
        if self.cluster_id.is_empty() {
            return Err(ClientError::Config("cluster id is required".to_string()));
        }
        if self.proxy_address.is_empty() {
            return Err(ClientError::Config("proxy address is required".to_string()));
        }
        if !self.proxy_address.starts_with("ws://") && !self.proxy_address.starts_with("wss://") {
            return Err(ClientError::Config(format!(
                "proxy address {} must use ws:// or wss://",
                self.proxy_address
            )));
        }
        if self.local_endpoint.is_empty() {
            return Err(ClientError::Config("local endpoint is required".to_string()));
        }
        if self.tls_config.is_none() {
            return Err(ClientError::Config("TLS config is required".to_string()));
        }
        Ok(())
    }

    /// Headers sent with every session upgrade
    pub fn connect_headers(&self) -> ClientResult<HeaderMap> {
        fn value(name: &str, raw: &str) -> ClientResult<HeaderValue> {
            HeaderValue::from_str(raw)
                .map_err(|_| ClientError::Config(format!("invalid value for {}", name)))
        }

        let address_header = HeaderName::from_bytes(self.cluster_address_header.as_bytes())
            .map_err(|_| {
                ClientError::Config(format!(
                    "invalid header name {}",
                    self.cluster_address_header
                ))
            })?;

        let mut map = HeaderMap::new();
        map.insert(headers::TUNNEL_ID, value("cluster id", &self.cluster_id)?);
        map.insert(headers::TUNNEL_TOKEN, value("token", &self.token)?);
        map.insert(address_header, value("local endpoint", &self.local_endpoint)?);
        if let Some(proxy_token) = &self.proxy_token {
            map.insert(
                PROXY_AUTHORIZATION,
                value("proxy token", &format!("Bearer {}", proxy_token))?,
            );
        }
        Ok(map)
    }
}
