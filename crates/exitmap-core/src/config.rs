//! Run configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tor_control::LaunchOptions;

use crate::directory::DEFAULT_DIRECTORY_URL;

/// URLs probed through every exit.
pub const DEFAULT_URLS: [&str; 4] = [
    "https://ooni.org/robots.txt",
    "https://www.google.com/robots.txt",
    "https://www.apple.com/robots.txt",
    "https://www.bbc.com/robots.txt",
];

/// Settings for one measurement run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    pub directory_url: String,
    /// Shuffle the worklist before probing.
    pub randomize: bool,
    pub urls: Vec<String>,
    /// Per-URL fetch timeout (seconds).
    pub fetch_timeout_secs: u64,
    /// Wait for a circuit to be BUILT (seconds).
    pub build_timeout_secs: u64,
    /// Directory HTTP timeout (seconds).
    pub directory_timeout_secs: u64,
    pub tor: TorLaunchConfig,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            directory_url: DEFAULT_DIRECTORY_URL.to_string(),
            randomize: true,
            urls: DEFAULT_URLS.iter().map(|u| u.to_string()).collect(),
            fetch_timeout_secs: 10,
            build_timeout_secs: 60,
            directory_timeout_secs: 60,
            tor: TorLaunchConfig::default(),
        }
    }
}

impl ProbeConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_secs(self.directory_timeout_secs)
    }
}

/// How the dedicated daemon is started.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TorLaunchConfig {
    pub tor_binary: PathBuf,
    pub data_dir: PathBuf,
    /// File receiving daemon INFO events; `None` logs them at debug level.
    pub log_file: Option<PathBuf>,
    /// Start plus bootstrap (seconds).
    pub launch_timeout_secs: u64,
    /// Extra torrc options, passed as `--Key value`.
    #[serde(default)]
    pub torrc_options: Vec<(String, String)>,
}

impl Default for TorLaunchConfig {
    fn default() -> Self {
        Self {
            tor_binary: PathBuf::from("tor"),
            data_dir: default_data_dir(),
            log_file: None,
            launch_timeout_secs: 180,
            torrc_options: Vec::new(),
        }
    }
}

impl TorLaunchConfig {
    pub fn launch_options(&self) -> LaunchOptions {
        let mut options = LaunchOptions::new(&self.data_dir)
            .with_timeout(Duration::from_secs(self.launch_timeout_secs));
        options.tor_binary = self.tor_binary.clone();
        options.extra_args = self
            .torrc_options
            .iter()
            .flat_map(|(key, value)| [format!("--{key}"), value.clone()])
            .collect();
        options
    }
}

/// `~/.config/txexitmap/tor_datadir`, relative to the working directory
/// when `HOME` is unset.
pub fn default_data_dir() -> PathBuf {
    let base = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(".config").join("txexitmap").join("tor_datadir")
}
