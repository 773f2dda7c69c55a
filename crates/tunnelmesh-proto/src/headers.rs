//! HTTP header names exchanged during the session handshake

/// Identity of the connecting agent (its cluster id)
pub const TUNNEL_ID: &str = "x-api-tunnel-id";

/// Shared secret presented by agents and peers
pub const TUNNEL_TOKEN: &str = "x-api-tunnel-token";

/// Identity of a connecting peer instance. Its presence marks the upgrade
/// request as a peer connection rather than an agent connection.
pub const TUNNEL_PEER_ID: &str = "x-api-tunnel-peer-id";

/// Default header carrying the address an agent advertises for its cluster
pub const DEFAULT_CLUSTER_ADDRESS: &str = "x-cluster-address";
