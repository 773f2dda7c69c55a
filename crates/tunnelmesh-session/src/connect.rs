//! Outbound session establishment

use http::HeaderMap;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::{connect_async_tls_with_config, tungstenite, Connector};
use tracing::debug;

use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::session::{ConnectHandler, Session};

/// Dial a session server at `url` (`ws://` or `wss://`).
///
/// `headers` are sent with the upgrade request and carry the caller's
/// identity. A rejected upgrade surfaces as [`SessionError::Rejected`] with
/// the HTTP status. Connect requests from the server are served by `handler`.
pub async fn dial(
    url: &str,
    headers: &HeaderMap,
    tls: Option<Arc<rustls::ClientConfig>>,
    handler: Option<Arc<dyn ConnectHandler>>,
    config: &SessionConfig,
) -> SessionResult<Session> {
    let mut request = url.into_client_request()?;
    for (name, value) in headers {
        request.headers_mut().insert(name.clone(), value.clone());
    }

    if tls.is_some() {
        crate::tls::ensure_crypto_provider();
    }
    let connector = tls.map(Connector::Rustls);

    let (ws, response) = match connect_async_tls_with_config(request, None, false, connector).await
    {
        Ok(established) => established,
        Err(tungstenite::Error::Http(response)) => {
            return Err(SessionError::Rejected(response.status().as_u16()))
        }
        Err(e) => return Err(e.into()),
    };

    debug!(url, status = %response.status(), "Session handshake complete");

    Ok(Session::spawn(ws, Role::Client, url, config, handler))
}
