//! Launching a dedicated Tor daemon and bringing its control port up.
//!
//! The daemon is started with an automatic control and SOCKS port, writes
//! the chosen control address into the data directory, and is killed when
//! the returned [`TorProcess`] is dropped.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::connection::ControlConnection;
use crate::error::{ControlError, ControlResult};

const PORT_FILE: &str = "control_port";
const COOKIE_FILE: &str = "control_auth_cookie";
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Options for starting the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchOptions {
    /// Path or name of the `tor` executable
    pub tor_binary: PathBuf,
    /// Data directory (created with mode 0700 if missing)
    pub data_directory: PathBuf,
    /// Upper bound for start + bootstrap
    pub timeout: Duration,
    /// Additional `--Option value` pairs passed through verbatim
    pub extra_args: Vec<String>,
}

impl LaunchOptions {
    pub fn new(data_directory: impl Into<PathBuf>) -> Self {
        LaunchOptions {
            tor_binary: PathBuf::from("tor"),
            data_directory: data_directory.into(),
            timeout: Duration::from_secs(180),
            extra_args: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn args(&self) -> Vec<String> {
        let data_dir = self.data_directory.to_string_lossy().to_string();
        let port_file = self.data_directory.join(PORT_FILE);
        let mut args = vec![
            "--DataDirectory".to_string(),
            data_dir,
            "--ControlPort".to_string(),
            "auto".to_string(),
            "--ControlPortWriteToFile".to_string(),
            port_file.to_string_lossy().to_string(),
            "--SocksPort".to_string(),
            "auto".to_string(),
            "--CookieAuthentication".to_string(),
            "1".to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// A running, bootstrapped, authenticated daemon.
pub struct TorProcess {
    // Held for kill_on_drop
    _child: Child,
    pub control: Arc<ControlConnection>,
    pub version: String,
    /// SOCKS listener, `host:port`
    pub socks_addr: String,
}

impl TorProcess {
    /// Start the daemon and wait until it reports full bootstrap.
    pub async fn launch(options: &LaunchOptions) -> ControlResult<Self> {
        create_data_directory(&options.data_directory)?;
        let port_file = options.data_directory.join(PORT_FILE);
        if port_file.exists() {
            std::fs::remove_file(&port_file)?;
        }

        let mut child = Command::new(&options.tor_binary)
            .args(options.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ControlError::Launch(format!(
                    "cannot spawn {}: {}",
                    options.tor_binary.display(),
                    e
                ))
            })?;

        let ready = tokio::time::timeout(options.timeout, bring_up(&mut child, options)).await;
        match ready {
            Ok(Ok((control, version, socks_addr))) => {
                info!(version = %version, socks = %socks_addr, "Started Tor version {}", version);
                Ok(TorProcess {
                    _child: child,
                    control,
                    version,
                    socks_addr,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ControlError::Launch(format!(
                "tor not ready within {}s",
                options.timeout.as_secs()
            ))),
        }
    }
}

async fn bring_up(
    child: &mut Child,
    options: &LaunchOptions,
) -> ControlResult<(Arc<ControlConnection>, String, String)> {
    let addr = wait_for_control_port(child, &options.data_directory.join(PORT_FILE)).await?;
    debug!(%addr, "control port published");

    let control = Arc::new(ControlConnection::connect(addr).await?);
    let cookie = tokio::fs::read(options.data_directory.join(COOKIE_FILE)).await?;
    control
        .command(&format!("AUTHENTICATE {}", hex::encode(cookie)))
        .await?;
    control.command("TAKEOWNERSHIP").await?;

    wait_for_bootstrap(&control).await?;

    let version = control.get_info("version").await?;
    let socks_addr = first_listener(&control.get_info("net/listeners/socks").await?)
        .ok_or_else(|| ControlError::Launch("tor reports no SOCKS listener".to_string()))?;
    Ok((control, version, socks_addr))
}

async fn wait_for_control_port(child: &mut Child, port_file: &Path) -> ControlResult<SocketAddr> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Err(ControlError::Launch(format!("tor exited early with {status}")));
        }
        if let Ok(contents) = tokio::fs::read_to_string(port_file).await {
            if let Some(addr) = parse_port_file(&contents) {
                return Ok(addr);
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn wait_for_bootstrap(control: &ControlConnection) -> ControlResult<()> {
    let mut last_progress = None;
    loop {
        let phase = control.get_info("status/bootstrap-phase").await?;
        let progress = bootstrap_progress(&phase);
        if progress != last_progress {
            debug!(progress = ?progress, phase = %phase, "bootstrap progress");
            last_progress = progress;
        }
        if progress == Some(100) {
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// `PORT=127.0.0.1:40123` → socket address.
pub fn parse_port_file(contents: &str) -> Option<SocketAddr> {
    contents
        .lines()
        .find_map(|line| line.trim().strip_prefix("PORT="))
        .and_then(|addr| addr.parse().ok())
}

/// Extract `PROGRESS=NN` from a bootstrap status line.
pub fn bootstrap_progress(phase: &str) -> Option<u8> {
    phase
        .split_whitespace()
        .find_map(|part| part.strip_prefix("PROGRESS="))
        .and_then(|p| p.parse().ok())
}

/// First address of a `net/listeners/*` value (space separated, quoted).
pub fn first_listener(value: &str) -> Option<String> {
    value
        .split_whitespace()
        .next()
        .map(|addr| addr.trim_matches('"').to_string())
        .filter(|addr| !addr.is_empty())
}

fn create_data_directory(path: &Path) -> ControlResult<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)?;
    Ok(())
}
