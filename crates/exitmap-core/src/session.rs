//! Control session abstraction and its manager.
//!
//! The manager exclusively owns the single live session. Everything else
//! borrows it for the duration of one call and never keeps it.

use std::sync::Arc;

use async_trait::async_trait;
use tor_control::{CircuitId, ControlResult, Router};
use tracing::info;

use crate::error::Result;
use crate::fetch::HttpFetcher;

/// Operations the prober and fetch runner need from a live daemon session.
#[async_trait]
pub trait ControlSession: Send + Sync {
    /// `GETINFO <key>`.
    async fn get_info(&self, key: &str) -> ControlResult<String>;

    /// Current guard set.
    fn guards(&self) -> Vec<Router>;

    /// Router by `"$" + fingerprint`.
    fn router_by_hash(&self, hash: &str) -> Option<Router>;

    /// Request a circuit over exactly `path`, skipping guard selection.
    ///
    /// At most one circuit may be pending; a new request replaces the old.
    async fn build_circuit(&self, path: &[Router]) -> ControlResult<CircuitId>;

    /// Wait for the pending circuit to be built. Unbounded; callers time it.
    async fn when_built(&self, circuit: &CircuitId) -> ControlResult<()>;

    /// HTTP client whose requests travel over `circuit`.
    fn http_fetcher(&self, circuit: &CircuitId) -> ControlResult<Arc<dyn HttpFetcher>>;

    /// False once the distinguished disconnect has been observed.
    fn is_connected(&self) -> bool;
}

/// Starts daemon sessions.
#[async_trait]
pub trait DaemonLauncher: Send + Sync {
    type Session: ControlSession + 'static;

    /// Start a fresh daemon and wait for readiness. Failures are `Launch`.
    async fn launch(&self) -> Result<Self::Session>;

    /// Release launcher-wide resources such as the daemon log sink.
    async fn close(&self) {}
}

/// Owns the one live session; replaces it on relaunch.
pub struct SessionManager<L: DaemonLauncher> {
    launcher: L,
    session: Option<L::Session>,
    launches: u32,
}

impl<L: DaemonLauncher> SessionManager<L> {
    pub fn new(launcher: L) -> Self {
        SessionManager {
            launcher,
            session: None,
            launches: 0,
        }
    }

    /// Start (or restart) the daemon.
    ///
    /// A live session is dropped first without draining; its circuits are
    /// unusable afterwards.
    pub async fn launch(&mut self) -> Result<&L::Session> {
        if self.session.take().is_some() {
            info!("discarding current control session");
        }
        let session = self.launcher.launch().await?;
        self.launches += 1;
        Ok(self.session.insert(session))
    }

    pub fn current_session(&self) -> Option<&L::Session> {
        self.session.as_ref()
    }

    /// Number of successful launches so far.
    pub fn launches(&self) -> u32 {
        self.launches
    }

    /// Drop the session and close the launcher's resources.
    pub async fn shutdown(&mut self) {
        self.session = None;
        self.launcher.close().await;
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }
}
