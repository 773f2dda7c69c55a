//! Peer manager: keeps the peer mesh in sync with service discovery
//!
//! The reconciliation loop subscribes to a discovery watch, lists the peer
//! service, wires every sibling instance into the session server as an
//! outbound peer and unwires the ones that disappeared, then waits on the
//! watch. Any watch event, or any end of the watch, triggers a full re-list
//! rather than an incremental update.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use tunnelmesh_session::SessionServer;

use crate::discovery::{self, Discovery, ServiceInstance, ServiceWatcher, WatchError};
use crate::error::{ManagerError, ManagerResult};

/// Operations the peer manager performs on the session layer
#[cfg_attr(test, mockall::automock)]
pub trait PeerTransport: Send + Sync {
    fn add_peer(&self, url: &str, id: &str, token: &str);
    fn remove_peer(&self, id: &str);
}

impl PeerTransport for SessionServer {
    fn add_peer(&self, url: &str, id: &str, token: &str) {
        SessionServer::add_peer(self, url, id, token)
    }

    fn remove_peer(&self, id: &str) {
        SessionServer::remove_peer(self, id)
    }
}

#[derive(Clone)]
pub struct PeerManagerOptions {
    /// This instance's own `host:port` as registered in discovery
    pub peer_id: String,
    pub token: String,
    pub service_name: String,
    /// Path of the session endpoint on every peer
    pub connect_path: String,
    /// Dial peers with `wss` instead of `ws`
    pub secure: bool,
    pub port_metadata_key: String,
    pub retry_interval: Duration,
    pub discovery: Option<Arc<dyn Discovery>>,
}

/// Changes applied by one reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl PeerDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// `added = desired \ current`, `removed = current \ desired`, both sorted
pub fn diff_peers(desired: &HashSet<String>, current: &HashSet<String>) -> PeerDiff {
    let mut added: Vec<String> = desired.difference(current).cloned().collect();
    let mut removed: Vec<String> = current.difference(desired).cloned().collect();
    added.sort();
    removed.sort();
    PeerDiff { added, removed }
}

#[derive(Default)]
struct PeerState {
    peers: HashSet<String>,
    ready: bool,
}

enum WatchSignal {
    Changed,
    Ended(WatchError),
}

#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<PeerManagerInner>,
}

struct PeerManagerInner {
    options: PeerManagerOptions,
    transport: Arc<dyn PeerTransport>,
    state: Mutex<PeerState>,
    cancel: CancellationToken,
}

impl PeerManager {
    pub fn new(
        options: PeerManagerOptions,
        transport: Arc<dyn PeerTransport>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(PeerManagerInner {
                options,
                transport,
                state: Mutex::new(PeerState::default()),
                cancel,
            }),
        }
    }

    /// Spawn the reconciliation loop
    pub fn start(&self) -> ManagerResult<JoinHandle<()>> {
        if self.inner.options.service_name.is_empty() {
            return Err(ManagerError::Config(
                "peer service name is required".to_string(),
            ));
        }
        let discovery = self.inner.options.discovery.clone().ok_or_else(|| {
            ManagerError::Config("a discovery client is required".to_string())
        })?;

        let manager = self.clone();
        Ok(tokio::spawn(async move { manager.run(discovery).await }))
    }

    /// Current peer addresses, sorted
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.lock().peers.iter().cloned().collect();
        peers.sort();
        peers
    }

    /// Whether this instance appeared in the last discovery snapshot
    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    /// Bring the peer set in line with a discovery snapshot
    pub fn reconcile(&self, instances: &[ServiceInstance]) -> PeerDiff {
        let options = &self.inner.options;
        let mut desired = HashSet::new();
        let mut ready = false;

        for instance in instances {
            match discovery::peer_address(instance, &options.port_metadata_key) {
                Ok(address) if address == options.peer_id => ready = true,
                Ok(address) => {
                    desired.insert(address);
                }
                Err(reason) => {
                    warn!(instance_id = %instance.id, reason = %reason, "Skipping peer instance")
                }
            }
        }

        let mut state = self.lock();
        let diff = diff_peers(&desired, &state.peers);

        for address in &diff.added {
            let url = self.peer_url(address);
            debug!(peer = %address, url = %url, "Adding peer");
            self.inner.transport.add_peer(&url, address, &options.token);
        }
        for address in &diff.removed {
            debug!(peer = %address, "Removing peer");
            self.inner.transport.remove_peer(address);
        }

        state.peers = desired;
        state.ready = ready;
        diff
    }

    fn peer_url(&self, address: &str) -> String {
        let scheme = if self.inner.options.secure { "wss" } else { "ws" };
        format!("{}://{}{}", scheme, address, self.inner.options.connect_path)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PeerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self, discovery: Arc<dyn Discovery>) {
        let service = self.inner.options.service_name.clone();
        let cancel = self.inner.cancel.clone();
        info!(service = %service, "Peer manager started");

        loop {
            // Subscribe before listing so a change in between is not lost
            let watched = tokio::select! {
                _ = cancel.cancelled() => break,
                watched = discovery.watch(&service) => watched,
            };
            let watcher = match watched {
                Ok(watcher) => watcher,
                Err(e) => {
                    warn!(service = %service, error = %e, "Failed to watch peers");
                    if !self.pause().await {
                        break;
                    }
                    continue;
                }
            };

            let listed = tokio::select! {
                _ = cancel.cancelled() => break,
                listed = discovery.list(&service) => listed,
            };
            let instances = match listed {
                Ok(instances) => instances,
                Err(e) => {
                    warn!(service = %service, error = %e, "Failed to list peers");
                    if !self.pause().await {
                        break;
                    }
                    continue;
                }
            };

            let diff = self.reconcile(&instances);
            if !diff.is_empty() {
                info!(
                    added = ?diff.added,
                    removed = ?diff.removed,
                    ready = self.is_ready(),
                    "Peer set updated"
                );
            }

            let (signal_tx, mut signal_rx) = mpsc::channel(1);
            let consumer_cancel = cancel.child_token();
            tokio::spawn(consume_watch(watcher, signal_tx, consumer_cancel.clone()));

            let signal = tokio::select! {
                _ = cancel.cancelled() => break,
                signal = signal_rx.recv() => signal,
            };
            consumer_cancel.cancel();

            match signal {
                Some(WatchSignal::Changed) => debug!(service = %service, "Peer service changed"),
                Some(WatchSignal::Ended(e)) => {
                    warn!(service = %service, error = %e, "Peer watch ended, resyncing");
                    if !self.pause().await {
                        break;
                    }
                }
                None => {
                    if !self.pause().await {
                        break;
                    }
                }
            }
        }

        info!(service = %service, "Peer manager stopped");
    }

    /// Sleep for the retry interval. Returns false if cancelled meanwhile.
    async fn pause(&self) -> bool {
        tokio::select! {
            _ = self.inner.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.inner.options.retry_interval) => true,
        }
    }
}

async fn consume_watch(
    mut watcher: Box<dyn ServiceWatcher>,
    signals: mpsc::Sender<WatchSignal>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = watcher.next() => event,
        };

        let (signal, ended) = match event {
            Ok(()) => (WatchSignal::Changed, false),
            Err(e) => (WatchSignal::Ended(e), true),
        };

        // At most one signal is pending; the loop re-lists anyway
        if signals.try_send(signal).is_err() {
            trace!("Watch signal already pending");
        }
        if ended {
            return;
        }
    }
}
