//! In-memory fakes for the session, fetch, directory and sink traits
//! (testing only).
//!
//! `FakeLauncher` hands out `FakeSession`s driven by a `SessionScript`:
//! a guard set plus a per-exit `RelayBehavior`. All sessions of one
//! launcher share a circuit-build counter so tests can bound attempts.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tor_control::{CircuitId, ControlError, ControlResult, Router};

use crate::directory::RelayDirectory;
use crate::error::{ProbeError, Result};
use crate::fetch::{FetchError, HttpFetcher};
use crate::relay::{prepare_worklist, Relay};
use crate::row::MeasurementRow;
use crate::session::{ControlSession, DaemonLauncher};
use crate::sink::{ResultSink, SinkError, SinkResult};

// ---------------------------------------------------------------------------
// FakeFetcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum FakeResponse {
    Body(String),
    Fail(String),
    Hang,
}

/// Scripted HTTP fetcher. Unscripted URLs answer with a short body.
#[derive(Debug, Clone, Default)]
pub struct FakeFetcher {
    responses: HashMap<String, FakeResponse>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, url: &str, outcome: std::result::Result<String, String>) -> Self {
        let response = match outcome {
            Ok(body) => FakeResponse::Body(body),
            Err(reason) => FakeResponse::Fail(reason),
        };
        self.responses.insert(url.to_string(), response);
        self
    }

    /// `url` never completes.
    pub fn hang(mut self, url: &str) -> Self {
        self.responses.insert(url.to_string(), FakeResponse::Hang);
        self
    }
}

#[async_trait]
impl HttpFetcher for FakeFetcher {
    async fn get(&self, url: &str, _timeout: Duration) -> std::result::Result<String, FetchError> {
        match self.responses.get(url) {
            Some(FakeResponse::Body(body)) => Ok(body.clone()),
            Some(FakeResponse::Fail(reason)) => Err(FetchError(reason.clone())),
            Some(FakeResponse::Hang) => std::future::pending().await,
            None => Ok("User-agent: *\nDisallow:\n".to_string()),
        }
    }
}

/// Drops the session's connection after its first request.
struct DisconnectingFetcher {
    inner: FakeFetcher,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl HttpFetcher for DisconnectingFetcher {
    async fn get(&self, url: &str, timeout: Duration) -> std::result::Result<String, FetchError> {
        let result = self.inner.get(url, timeout).await;
        self.connected.store(false, Ordering::SeqCst);
        result
    }
}

/// Never answers.
struct HangingFetcher;

#[async_trait]
impl HttpFetcher for HangingFetcher {
    async fn get(&self, _url: &str, _timeout: Duration) -> std::result::Result<String, FetchError> {
        std::future::pending().await
    }
}

// ---------------------------------------------------------------------------
// FakeSession
// ---------------------------------------------------------------------------

/// How a fake session treats one exit relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayBehavior {
    /// Circuit builds; fetches go to the script's fetcher.
    #[default]
    Builds,
    /// `GETINFO ns/id/...` is rejected.
    InfoFails,
    /// Absent from the network state.
    Unknown,
    /// The daemon reports the circuit FAILED.
    BuildFails,
    /// BUILT never arrives.
    NeverBuilt,
    /// Connection drops on the first info lookup.
    DisconnectOnInfo,
    /// Connection drops when the circuit is requested.
    DisconnectOnBuild,
    /// Connection drops while waiting for BUILT.
    DisconnectWhileBuilding,
    /// Connection drops after the first URL has been fetched.
    DisconnectDuringFetch,
    /// Circuit builds but no request over it ever completes.
    FetchHangs,
}

/// Everything a fake session is scripted with.
#[derive(Debug, Clone)]
pub struct SessionScript {
    guards: Vec<Router>,
    relays: HashMap<String, RelayBehavior>,
    fetcher: FakeFetcher,
}

impl Default for SessionScript {
    fn default() -> Self {
        SessionScript {
            guards: ["1", "2", "3"]
                .iter()
                .map(|n| Router::bare(&n.repeat(40), &format!("guard{n}")))
                .collect(),
            relays: HashMap::new(),
            fetcher: FakeFetcher::new(),
        }
    }
}

impl SessionScript {
    pub fn without_guards() -> Self {
        SessionScript {
            guards: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_guards(mut self, fingerprints: &[&str]) -> Self {
        self.guards = fingerprints
            .iter()
            .map(|fp| Router::bare(fp, "guard"))
            .collect();
        self
    }

    pub fn relay(mut self, fingerprint: &str, behavior: RelayBehavior) -> Self {
        self.relays
            .insert(fingerprint.to_ascii_uppercase(), behavior);
        self
    }

    pub fn fetcher(mut self, fetcher: FakeFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    fn behavior(&self, fingerprint: &str) -> RelayBehavior {
        self.relays
            .get(&fingerprint.to_ascii_uppercase())
            .copied()
            .unwrap_or_default()
    }
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Scripted control session.
pub struct FakeSession {
    script: SessionScript,
    generation: u64,
    connected: Arc<AtomicBool>,
    build_attempts: Arc<AtomicUsize>,
    next_circuit: AtomicU64,
    circuits: Mutex<HashMap<CircuitId, RelayBehavior>>,
    info_queries: Mutex<Vec<String>>,
}

impl FakeSession {
    pub fn new(script: SessionScript) -> Self {
        Self::with_counter(script, Arc::new(AtomicUsize::new(0)))
    }

    fn with_counter(script: SessionScript, build_attempts: Arc<AtomicUsize>) -> Self {
        FakeSession {
            script,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::SeqCst),
            connected: Arc::new(AtomicBool::new(true)),
            build_attempts,
            next_circuit: AtomicU64::new(1),
            circuits: Mutex::new(HashMap::new()),
            info_queries: Mutex::new(Vec::new()),
        }
    }

    /// Process-unique id of this session.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Simulate the daemon going away.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn build_attempts(&self) -> usize {
        self.build_attempts.load(Ordering::SeqCst)
    }

    pub fn info_queries(&self) -> Vec<String> {
        self.info_queries.lock().unwrap().clone()
    }

    pub fn guard_fingerprints(&self) -> Vec<String> {
        self.script
            .guards
            .iter()
            .map(|g| g.fingerprint.clone())
            .collect()
    }

    fn ensure_connected(&self) -> ControlResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ControlError::Disconnected)
        }
    }

    fn circuit_behavior(&self, circuit: &CircuitId) -> ControlResult<RelayBehavior> {
        self.circuits
            .lock()
            .unwrap()
            .get(circuit)
            .copied()
            .ok_or_else(|| ControlError::Protocol(format!("unknown circuit {circuit}")))
    }
}

#[async_trait]
impl ControlSession for FakeSession {
    async fn get_info(&self, key: &str) -> ControlResult<String> {
        self.ensure_connected()?;
        self.info_queries.lock().unwrap().push(key.to_string());
        let fingerprint = key.rsplit('/').next().unwrap_or_default();
        match self.script.behavior(fingerprint) {
            RelayBehavior::InfoFails => Err(ControlError::Rejected {
                command: "GETINFO".to_string(),
                code: 552,
                message: format!("Unrecognized key \"{key}\""),
            }),
            RelayBehavior::DisconnectOnInfo => {
                self.disconnect();
                Err(ControlError::Disconnected)
            }
            _ => Ok(String::new()),
        }
    }

    fn guards(&self) -> Vec<Router> {
        self.script.guards.clone()
    }

    fn router_by_hash(&self, hash: &str) -> Option<Router> {
        let fingerprint = hash.trim_start_matches('$');
        match self.script.behavior(fingerprint) {
            RelayBehavior::Unknown => None,
            _ => Some(Router::bare(fingerprint, "exit")),
        }
    }

    async fn build_circuit(&self, path: &[Router]) -> ControlResult<CircuitId> {
        self.ensure_connected()?;
        self.build_attempts.fetch_add(1, Ordering::SeqCst);
        let exit = path
            .last()
            .ok_or_else(|| ControlError::Protocol("empty circuit path".to_string()))?;
        let behavior = self.script.behavior(&exit.fingerprint);
        if behavior == RelayBehavior::DisconnectOnBuild {
            self.disconnect();
            return Err(ControlError::Disconnected);
        }
        let id = CircuitId(self.next_circuit.fetch_add(1, Ordering::SeqCst).to_string());
        self.circuits.lock().unwrap().insert(id.clone(), behavior);
        Ok(id)
    }

    async fn when_built(&self, circuit: &CircuitId) -> ControlResult<()> {
        self.ensure_connected()?;
        match self.circuit_behavior(circuit)? {
            RelayBehavior::BuildFails => Err(ControlError::CircuitFailed {
                circuit: circuit.0.clone(),
                reason: "DESTROYED".to_string(),
            }),
            RelayBehavior::NeverBuilt => std::future::pending().await,
            RelayBehavior::DisconnectWhileBuilding => {
                self.disconnect();
                Err(ControlError::Disconnected)
            }
            _ => Ok(()),
        }
    }

    fn http_fetcher(&self, circuit: &CircuitId) -> ControlResult<Arc<dyn HttpFetcher>> {
        self.ensure_connected()?;
        let fetcher = self.script.fetcher.clone();
        match self.circuit_behavior(circuit)? {
            RelayBehavior::DisconnectDuringFetch => Ok(Arc::new(DisconnectingFetcher {
                inner: fetcher,
                connected: Arc::clone(&self.connected),
            })),
            RelayBehavior::FetchHangs => Ok(Arc::new(HangingFetcher)),
            _ => Ok(Arc::new(fetcher)),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// FakeLauncher
// ---------------------------------------------------------------------------

/// Launcher handing out one scripted session per launch.
///
/// Launch `i` uses `scripts[i]`, or the last script once they run out.
pub struct FakeLauncher {
    scripts: Vec<SessionScript>,
    fail_from: Option<usize>,
    launches: AtomicUsize,
    build_attempts: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl FakeLauncher {
    pub fn new(scripts: Vec<SessionScript>) -> Self {
        FakeLauncher {
            scripts,
            fail_from: None,
            launches: AtomicUsize::new(0),
            build_attempts: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    /// Launch attempts with index `>= n` fail.
    pub fn fail_from(mut self, n: usize) -> Self {
        self.fail_from = Some(n);
        self
    }

    /// Launch attempts so far, successful or not.
    pub fn launch_attempts(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Circuit builds requested across all sessions.
    pub fn build_attempts(&self) -> usize {
        self.build_attempts.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DaemonLauncher for FakeLauncher {
    type Session = FakeSession;

    async fn launch(&self) -> Result<FakeSession> {
        let index = self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail_from.is_some_and(|n| index >= n) {
            return Err(ProbeError::Launch(format!("scripted failure of launch {index}")));
        }
        let script = self
            .scripts
            .get(index)
            .or_else(|| self.scripts.last())
            .cloned()
            .unwrap_or_default();
        Ok(FakeSession::with_counter(
            script,
            Arc::clone(&self.build_attempts),
        ))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// StaticDirectory
// ---------------------------------------------------------------------------

/// Directory serving a fixed relay list, or failing.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    relays: Vec<Relay>,
    fail: bool,
}

impl StaticDirectory {
    pub fn new(relays: Vec<Relay>) -> Self {
        StaticDirectory { relays, fail: false }
    }

    pub fn failing() -> Self {
        StaticDirectory {
            relays: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl RelayDirectory for StaticDirectory {
    async fn fetch(&self, randomize: bool) -> Result<Vec<Relay>> {
        if self.fail {
            return Err(ProbeError::DirectoryFetch("scripted directory failure".to_string()));
        }
        Ok(prepare_worklist(
            self.relays.clone(),
            randomize,
            &mut StdRng::seed_from_u64(0),
        ))
    }
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

/// Sink collecting rows in memory. Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    rows: Arc<Mutex<Vec<MeasurementRow>>>,
    fail_urls: Arc<HashSet<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes of rows for `url` fail.
    pub fn failing_on(urls: &[&str]) -> Self {
        MemorySink {
            rows: Arc::default(),
            fail_urls: Arc::new(urls.iter().map(|u| u.to_string()).collect()),
        }
    }

    pub fn rows(&self) -> Vec<MeasurementRow> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn write(&mut self, row: &MeasurementRow) -> SinkResult<()> {
        if self.fail_urls.contains(&row.url) {
            return Err(SinkError(format!("scripted write failure for {}", row.url)));
        }
        self.rows.lock().unwrap().push(row.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Serve every connection on a local port with `status` and `body`.
pub async fn spawn_http_server(status: u16, body: &str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let response = format!(
        "HTTP/1.1 {status} Scripted\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    );
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let response = response.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}
