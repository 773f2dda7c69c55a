//! Tunnel client (agent)
//!
//! Runs next to a cluster's local service, keeps a session open to the
//! tunnel manager and serves the TCP connects the manager sends through it.

pub mod backoff;
pub mod client;
pub mod error;
pub mod metrics;
pub mod options;

pub use backoff::ReconnectBackoff;
pub use client::TunnelClient;
pub use error::{ClientError, ClientResult};
pub use metrics::{encode_registry, ClientMetrics};
pub use options::ClientOptions;
