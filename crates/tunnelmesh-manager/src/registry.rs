//! Cluster registry for tracking authorized clusters
//!
//! One entry per cluster id, created when the cluster's agent is first
//! authorized. The entry caches the HTTP transport used to reach the
//! cluster's backend; the cache is dropped whenever the cluster advertises a
//! different server address, so connections to a moved backend are never
//! reused.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use crate::transport::BackendTransport;

/// A registered cluster
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    pub cluster_id: String,
    /// Address the cluster's agent advertised for its backend
    pub server_address: String,
    /// Lazily built transport to the backend
    pub transport: Option<BackendTransport>,
    pub registered_at: DateTime<Utc>,
    pub last_authorized_at: DateTime<Utc>,
}

impl ClusterInfo {
    pub fn new(cluster_id: impl Into<String>, server_address: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            cluster_id: cluster_id.into(),
            server_address: server_address.into(),
            transport: None,
            registered_at: now,
            last_authorized_at: now,
        }
    }
}

/// Result of [`ClusterRegistry::upsert`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Unchanged,
    /// The address changed and any cached transport was dropped
    AddressChanged { previous: String },
}

/// Registry of clusters, guarded by a single lock
#[derive(Debug, Clone, Default)]
pub struct ClusterRegistry {
    clusters: Arc<RwLock<HashMap<String, ClusterInfo>>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an authorized cluster and the address it advertised
    pub fn upsert(&self, cluster_id: &str, server_address: &str) -> Upsert {
        let mut clusters = self.write();

        match clusters.get_mut(cluster_id) {
            None => {
                clusters.insert(
                    cluster_id.to_string(),
                    ClusterInfo::new(cluster_id, server_address),
                );
                tracing::info!(
                    cluster_id = %cluster_id,
                    server_address = %server_address,
                    "Registered new cluster"
                );
                Upsert::Created
            }
            Some(info) => {
                info.last_authorized_at = Utc::now();
                if info.server_address == server_address {
                    return Upsert::Unchanged;
                }

                let previous = std::mem::replace(&mut info.server_address, server_address.to_string());
                let dropped = info.transport.take();
                tracing::info!(
                    cluster_id = %cluster_id,
                    previous = %previous,
                    server_address = %server_address,
                    dropped_generation = ?dropped.as_ref().map(BackendTransport::generation),
                    "Cluster address changed, discarding cached transport"
                );
                Upsert::AddressChanged { previous }
            }
        }
    }

    /// Remove a cluster, returning its entry if it was registered
    pub fn remove(&self, cluster_id: &str) -> Option<ClusterInfo> {
        let removed = self.write().remove(cluster_id);
        if removed.is_some() {
            tracing::info!(cluster_id = %cluster_id, "Evicted cluster");
        }
        removed
    }

    pub fn get(&self, cluster_id: &str) -> Option<ClusterInfo> {
        self.clusters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cluster_id)
            .cloned()
    }

    pub fn list(&self) -> Vec<ClusterInfo> {
        self.clusters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clusters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exclusive access for read-modify-write sequences
    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ClusterInfo>> {
        self.clusters.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_keeps_one_entry_per_cluster() {
        let registry = ClusterRegistry::new();

        assert_eq!(registry.upsert("c1", "10.0.0.5:9443"), Upsert::Created);
        assert_eq!(registry.upsert("c1", "10.0.0.5:9443"), Upsert::Unchanged);
        assert_eq!(
            registry.upsert("c1", "10.0.0.6:9443"),
            Upsert::AddressChanged {
                previous: "10.0.0.5:9443".to_string()
            }
        );
        assert_eq!(registry.upsert("c1", "10.0.0.7:9443"), Upsert::AddressChanged {
            previous: "10.0.0.6:9443".to_string()
        });

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("c1").unwrap().server_address, "10.0.0.7:9443");
    }

    #[test]
    fn test_remove() {
        let registry = ClusterRegistry::new();
        registry.upsert("c1", "10.0.0.5:9443");
        registry.upsert("c2", "10.0.0.6:9443");

        assert!(registry.remove("c1").is_some());
        assert!(registry.remove("c1").is_none());
        assert!(registry.get("c1").is_none());
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_clones_share_state() {
        let registry = ClusterRegistry::new();
        let other = registry.clone();
        registry.upsert("c1", "a:1");
        assert_eq!(other.len(), 1);
        assert!(!other.is_empty());
    }
}
