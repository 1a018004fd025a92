//! Tor-backed [`DaemonLauncher`] and [`ControlSession`].
//!
//! Each launch starts a fresh daemon, keeps new streams unattached, and
//! runs a stream attacher that pins them to the circuit most recently
//! handed out by [`ControlSession::http_fetcher`].

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tor_control::{
    extend_circuit, spawn_attacher, AttachTarget, CircuitId, ControlConnection, ControlError,
    ControlResult, LaunchOptions, NetworkState, PendingCircuit, Router, TorProcess,
};
use tracing::{debug, info, warn};

use crate::error::{ProbeError, Result};
use crate::fetch::{HttpFetcher, ReqwestFetcher};
use crate::session::{ControlSession, DaemonLauncher};

/// Shared daemon INFO log, truncated when the launcher is created.
type DaemonLog = Arc<tokio::sync::Mutex<tokio::fs::File>>;

/// Launches a dedicated `tor` per session.
pub struct TorLauncher {
    options: LaunchOptions,
    log: Option<DaemonLog>,
}

impl TorLauncher {
    pub fn new(options: LaunchOptions) -> Self {
        TorLauncher { options, log: None }
    }

    /// Append daemon INFO events of every session to `path`.
    pub async fn with_log_file(mut self, path: &Path) -> Result<Self> {
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|e| ProbeError::Launch(format!("cannot open {}: {}", path.display(), e)))?;
        self.log = Some(Arc::new(tokio::sync::Mutex::new(file)));
        Ok(self)
    }
}

#[async_trait]
impl DaemonLauncher for TorLauncher {
    type Session = TorSession;

    async fn launch(&self) -> Result<TorSession> {
        info!(data_dir = %self.options.data_directory.display(), "launching tor");
        let process = TorProcess::launch(&self.options)
            .await
            .map_err(|e| ProbeError::Launch(e.to_string()))?;
        let control = Arc::clone(&process.control);
        let socks_addr = process.socks_addr.clone();
        TorSession::attach(control, socks_addr, self.log.clone(), Some(process))
            .await
            .map_err(|e| ProbeError::Launch(e.to_string()))
    }

    async fn close(&self) {
        if let Some(log) = &self.log {
            if let Err(e) = log.lock().await.flush().await {
                warn!(error = %e, "failed to flush tor log");
            }
        }
    }
}

/// One live daemon session.
pub struct TorSession {
    control: Arc<ControlConnection>,
    state: NetworkState,
    socks_addr: String,
    target: AttachTarget,
    pending: Mutex<Option<PendingCircuit>>,
    attacher: JoinHandle<()>,
    log_task: JoinHandle<()>,
    // Dropped last: kills the daemon
    _process: Option<TorProcess>,
}

impl TorSession {
    /// Configure an authenticated, bootstrapped control connection for
    /// explicit stream attachment and load the network state.
    pub async fn attach(
        control: Arc<ControlConnection>,
        socks_addr: String,
        log: Option<DaemonLog>,
        process: Option<TorProcess>,
    ) -> ControlResult<Self> {
        control.set_conf("__LeaveStreamsUnattached", "1").await?;
        let log_task = spawn_log_writer(&control, log);
        control.set_events(&["CIRC", "STREAM", "INFO"]).await?;

        let state = NetworkState::create(&control).await?;
        let target = AttachTarget::default();
        let attacher = spawn_attacher(Arc::clone(&control), target.clone());
        debug!(
            routers = state.routers_by_hash.len(),
            guards = state.guards.len(),
            socks = %socks_addr,
            "tor session ready"
        );

        Ok(TorSession {
            control,
            state,
            socks_addr,
            target,
            pending: Mutex::new(None),
            attacher,
            log_task,
            _process: process,
        })
    }
}

impl Drop for TorSession {
    fn drop(&mut self) {
        self.attacher.abort();
        self.log_task.abort();
    }
}

#[async_trait]
impl ControlSession for TorSession {
    async fn get_info(&self, key: &str) -> ControlResult<String> {
        self.control.get_info(key).await
    }

    fn guards(&self) -> Vec<Router> {
        let mut guards: Vec<Router> = self.state.guards.values().cloned().collect();
        guards.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        guards
    }

    fn router_by_hash(&self, hash: &str) -> Option<Router> {
        self.state.router(hash).cloned()
    }

    async fn build_circuit(&self, path: &[Router]) -> ControlResult<CircuitId> {
        let pending = extend_circuit(&self.control, path).await?;
        let id = pending.id.clone();
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(pending);
        Ok(id)
    }

    async fn when_built(&self, circuit: &CircuitId) -> ControlResult<()> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .filter(|p| &p.id == circuit)
            .ok_or_else(|| ControlError::Protocol(format!("no pending circuit {circuit}")))?;
        pending.when_built().await.map(|_| ())
    }

    fn http_fetcher(&self, circuit: &CircuitId) -> ControlResult<Arc<dyn HttpFetcher>> {
        if self.control.is_closed() {
            return Err(ControlError::Disconnected);
        }
        self.target.set(Some(circuit.clone()));
        let fetcher = ReqwestFetcher::via_socks(&self.socks_addr)
            .map_err(|e| ControlError::Protocol(format!("cannot build SOCKS client: {e}")))?;
        Ok(Arc::new(fetcher))
    }

    fn is_connected(&self) -> bool {
        !self.control.is_closed()
    }
}

/// Copy `650 INFO` events to the daemon log, or to `debug!` without one,
/// until the connection closes.
fn spawn_log_writer(control: &ControlConnection, file: Option<DaemonLog>) -> JoinHandle<()> {
    let mut events = control.subscribe();
    tokio::spawn(async move {
        while let Ok(reply) = events.recv().await {
            let Some(message) = reply.first_text().strip_prefix("INFO ") else {
                continue;
            };
            let Some(file) = &file else {
                debug!(target: "tor", "{}", message);
                continue;
            };
            let line = format!(
                "{} [info] {}\n",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                message
            );
            if let Err(e) = file.lock().await.write_all(line.as_bytes()).await {
                warn!(error = %e, "tor log write failed");
                break;
            }
        }
    })
}
