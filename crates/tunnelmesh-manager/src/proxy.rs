//! Upgrade-aware reverse proxy to a cluster backend
//!
//! A [`BackendProxy`] forwards a request to the address a cluster advertised,
//! keeping the original path and query. Protocol upgrades (WebSocket, exec
//! streams) are passed through: when the backend answers `101`, both upgraded
//! connections are joined with a bidirectional copy.

use axum::body::Body;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{Extensions, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::transport::BackendTransport;

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Scheme and authority requests are rewritten to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    scheme: Scheme,
    authority: Authority,
}

impl BackendTarget {
    /// Parse an advertised server address.
    ///
    /// `https://host:port` and `http://host:port` are taken as given; a bare
    /// `host:port` means plain HTTP.
    pub fn parse(address: &str) -> Result<Self, ProxyError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(ProxyError::InvalidAddress(address.to_string()));
        }

        let uri: Uri = if address.contains("://") {
            address.parse()
        } else {
            format!("http://{}", address).parse()
        }
        .map_err(|_| ProxyError::InvalidAddress(address.to_string()))?;

        let scheme = match uri.scheme_str() {
            Some("http") => Scheme::HTTP,
            Some("https") => Scheme::HTTPS,
            _ => return Err(ProxyError::InvalidAddress(address.to_string())),
        };
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| ProxyError::InvalidAddress(address.to_string()))?;

        Ok(Self { scheme, authority })
    }

    pub fn is_https(&self) -> bool {
        self.scheme == Scheme::HTTPS
    }

    pub fn authority(&self) -> &str {
        self.authority.as_str()
    }
}

/// Forwards requests to one cluster's backend through its transport
#[derive(Debug, Clone)]
pub struct BackendProxy {
    target: BackendTarget,
    transport: BackendTransport,
}

impl BackendProxy {
    pub fn new(target: BackendTarget, transport: BackendTransport) -> Self {
        Self { target, transport }
    }

    pub fn target(&self) -> &BackendTarget {
        &self.target
    }

    pub fn transport(&self) -> &BackendTransport {
        &self.transport
    }

    pub async fn forward(&self, mut request: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let upgrading = is_upgrade(request.headers());
        let client_upgrade = upgrading.then(|| hyper::upgrade::on(&mut request));

        let outbound = self.rewrite(request, upgrading)?;
        debug!(
            method = %outbound.method(),
            uri = %outbound.uri(),
            upgrade = upgrading,
            "Forwarding request to backend"
        );

        let mut response = self.transport.request(outbound).await?;

        match client_upgrade {
            Some(client_upgrade) if response.status() == StatusCode::SWITCHING_PROTOCOLS => {
                let backend_upgrade = hyper::upgrade::on(&mut response);
                tokio::spawn(async move {
                    match tokio::try_join!(client_upgrade, backend_upgrade) {
                        Ok((client, backend)) => {
                            let mut client = TokioIo::new(client);
                            let mut backend = TokioIo::new(backend);
                            match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                                Ok((sent, received)) => {
                                    debug!(sent, received, "Upgraded connection closed")
                                }
                                Err(e) => debug!(error = %e, "Upgraded connection ended with error"),
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to complete protocol upgrade"),
                    }
                });
            }
            _ => strip_hop_by_hop(response.headers_mut()),
        }

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, Body::new(body)))
    }

    fn rewrite(&self, request: Request<Body>, upgrading: bool) -> Result<Request<Body>, ProxyError> {
        let (mut parts, body) = request.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        parts.uri = Uri::builder()
            .scheme(self.target.scheme.clone())
            .authority(self.target.authority.clone())
            .path_and_query(path_and_query)
            .build()?;
        parts.version = Version::HTTP_11;
        parts.extensions = Extensions::new();

        if !upgrading {
            strip_hop_by_hop(&mut parts.headers);
        }

        let host = HeaderValue::from_str(self.target.authority.as_str())
            .map_err(|_| ProxyError::InvalidAddress(self.target.authority.to_string()))?;
        parts.headers.insert(header::HOST, host);

        Ok(Request::from_parts(parts, body))
    }
}

fn is_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    connection_upgrade && headers.contains_key(header::UPGRADE)
}

/// Remove hop-by-hop headers, including any named in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}
