//! Tunnel manager
//!
//! Terminates agent sessions, keeps a registry of the clusters behind them
//! and proxies HTTP requests to those clusters through their sessions. A
//! [`PeerManager`] links every manager instance found in service discovery
//! so a request can land on any instance.
//!
//! ```text
//! request ──► Indexer ──► ClusterRegistry ──► BackendProxy ──► session ──► agent ──► backend
//! ```

pub mod discovery;
pub mod error;
pub mod indexer;
pub mod manager;
pub mod options;
pub mod peer;
pub mod proxy;
pub mod registry;
pub mod serve;
pub mod transport;

pub use discovery::{
    Discovery, DiscoveryError, ServiceInstance, ServiceWatcher, StaticDiscovery, WatchError,
};
pub use error::{ManagerError, ManagerResult, ProxyError, RouteError};
pub use indexer::{HeaderIndexer, IndexError, Indexer, PathIndexer};
pub use manager::{ManagerAuthorizer, TunnelManager};
pub use options::TunnelOptions;
pub use peer::{diff_peers, PeerDiff, PeerManager, PeerManagerOptions, PeerTransport};
pub use proxy::{BackendProxy, BackendTarget};
pub use registry::{ClusterInfo, ClusterRegistry, Upsert};
pub use transport::BackendTransport;
