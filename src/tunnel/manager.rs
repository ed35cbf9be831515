//! Owner of every tunnel in the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AicliError, Result};

use super::monitor::Monitor;
use super::port::pick_local_port;
use super::ssh::{OpenSshConnector, SshConnector};
use super::{TunnelEndpoint, TunnelKey, TunnelPolicy, TunnelSpec, TunnelState, TunnelStatus};

struct TunnelEntry {
    id: u64,
    spec: TunnelSpec,
    local_port: u16,
    status: Arc<watch::Sender<TunnelStatus>>,
    cancel: CancellationToken,
    monitor: Option<JoinHandle<()>>,
}

impl TunnelEntry {
    fn is_live(&self) -> bool {
        matches!(
            self.status.borrow().state,
            TunnelState::Connecting | TunnelState::Open | TunnelState::Degraded
        )
    }

    fn handle(&self) -> TunnelHandle {
        TunnelHandle {
            key: self.spec.key(),
            id: self.id,
            spec: self.spec.clone(),
            local_port: self.local_port,
            status: self.status.subscribe(),
        }
    }

    async fn teardown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.monitor.take() {
            if let Err(e) = task.await {
                warn!(tunnel = %self.spec, error = %e, "tunnel monitor ended abnormally");
            }
        }
        self.status
            .send_replace(TunnelStatus::new(TunnelState::Closed, Some(self.local_port)));
        info!(tunnel = %self.spec, port = self.local_port, "tunnel closed");
    }
}

/// Caller's view of a tunnel owned by a [`TunnelManager`].
///
/// Handles are not `Clone`; hand out [`TunnelEndpoint`]s instead.
#[derive(Debug)]
pub struct TunnelHandle {
    key: TunnelKey,
    id: u64,
    spec: TunnelSpec,
    local_port: u16,
    status: watch::Receiver<TunnelStatus>,
}

impl TunnelHandle {
    /// The port actually bound, which may differ from the requested one.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    pub fn status(&self) -> TunnelStatus {
        self.status.borrow().clone()
    }

    pub fn endpoint(&self) -> TunnelEndpoint {
        TunnelEndpoint::new(self.status.clone())
    }

    pub fn local_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.local_port)
    }
}

/// Row returned by [`TunnelManager::list`].
#[derive(Debug, Clone)]
pub struct TunnelSummary {
    pub spec: TunnelSpec,
    pub local_port: u16,
    pub status: TunnelStatus,
}

/// Opens, tracks and closes tunnels. At most one live tunnel per
/// [`TunnelKey`].
pub struct TunnelManager {
    connector: Arc<dyn SshConnector>,
    policy: TunnelPolicy,
    tunnels: Mutex<HashMap<TunnelKey, TunnelEntry>>,
    /// Serialises `open` so two callers never race to connect the same spec.
    opening: Mutex<()>,
    next_id: AtomicU64,
}

impl Default for TunnelManager {
    fn default() -> Self {
        Self::new(Arc::new(OpenSshConnector::new()), TunnelPolicy::default())
    }
}

impl std::fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelManager")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl TunnelManager {
    pub fn new(connector: Arc<dyn SshConnector>, policy: TunnelPolicy) -> Self {
        Self {
            connector,
            policy,
            tunnels: Mutex::new(HashMap::new()),
            opening: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> &TunnelPolicy {
        &self.policy
    }

    /// Open a tunnel, or return a handle to the live one for the same spec.
    ///
    /// A connect failure fails immediately; there are no retries at open time.
    pub async fn open(&self, spec: TunnelSpec) -> Result<TunnelHandle> {
        let _opening = self.opening.lock().await;
        let key = spec.key();

        let stale = {
            let mut tunnels = self.tunnels.lock().await;
            if let Some(entry) = tunnels.get(&key).filter(|entry| entry.is_live()) {
                debug!(tunnel = %spec, "reusing live tunnel");
                return Ok(entry.handle());
            }
            tunnels.remove(&key)
        };
        if let Some(entry) = stale {
            entry.teardown().await;
        }

        let local_port = pick_local_port(spec.local_port, self.policy.port_search_span)?;
        let (tx, _) = watch::channel(TunnelStatus::new(TunnelState::Connecting, Some(local_port)));
        let status = Arc::new(tx);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        self.tunnels.lock().await.insert(
            key.clone(),
            TunnelEntry {
                id,
                spec: spec.clone(),
                local_port,
                status: status.clone(),
                cancel: cancel.clone(),
                monitor: None,
            },
        );

        info!(tunnel = %spec, port = local_port, "opening tunnel");
        let session = match self
            .connector
            .connect(&spec, local_port, self.policy.connect_timeout)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(tunnel = %spec, error = %e, "tunnel open failed");
                status.send_replace(
                    TunnelStatus::new(TunnelState::Error, Some(local_port)).with_error(e.to_string()),
                );
                self.tunnels.lock().await.remove(&key);
                return Err(e);
            }
        };

        status.send_replace(TunnelStatus::new(TunnelState::Open, Some(local_port)));
        info!(tunnel = %spec, port = local_port, "tunnel open");

        let monitor = Monitor {
            spec,
            local_port,
            policy: self.policy.clone(),
            connector: self.connector.clone(),
            status: status.clone(),
            cancel,
        };
        let task = tokio::spawn(monitor.run(session));

        let mut tunnels = self.tunnels.lock().await;
        let entry = tunnels.get_mut(&key).filter(|entry| entry.id == id);
        match entry {
            Some(entry) => {
                entry.monitor = Some(task);
                Ok(entry.handle())
            }
            None => {
                // Closed by `close_all` while connecting.
                drop(tunnels);
                task.abort();
                status.send_replace(TunnelStatus::new(TunnelState::Closed, Some(local_port)));
                Err(AicliError::tunnel_connect("tunnel closed while connecting"))
            }
        }
    }

    /// Tear down the tunnel behind `handle`. Closing twice is a no-op.
    pub async fn close(&self, handle: &TunnelHandle) {
        let entry = {
            let mut tunnels = self.tunnels.lock().await;
            let owned = tunnels
                .get(&handle.key)
                .is_some_and(|entry| entry.id == handle.id);
            if owned {
                tunnels.remove(&handle.key)
            } else {
                None
            }
        };
        if let Some(entry) = entry {
            entry.teardown().await;
        }
    }

    pub async fn close_all(&self) {
        let entries: Vec<TunnelEntry> = {
            let mut tunnels = self.tunnels.lock().await;
            tunnels.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.teardown().await;
        }
    }

    pub async fn list(&self) -> Vec<TunnelSummary> {
        let tunnels = self.tunnels.lock().await;
        let mut rows: Vec<TunnelSummary> = tunnels
            .values()
            .map(|entry| TunnelSummary {
                spec: entry.spec.clone(),
                local_port: entry.local_port,
                status: entry.status.borrow().clone(),
            })
            .collect();
        rows.sort_by_key(|row| row.local_port);
        rows
    }
}

impl Drop for TunnelManager {
    fn drop(&mut self) {
        for entry in self.tunnels.get_mut().values() {
            entry.cancel.cancel();
        }
    }
}
