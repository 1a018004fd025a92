//! Error taxonomy for a measurement run.
//!
//! Each variant belongs to exactly one [`Disposition`], which is what the
//! orchestrator dispatches on.

use tor_control::ControlError;

/// Errors raised while measuring relays.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("relay directory fetch failed: {0}")]
    DirectoryFetch(String),

    #[error("daemon launch failed: {0}")]
    Launch(String),

    #[error("relay info lookup failed for {relay}: {reason}")]
    RelayInfo { relay: String, reason: String },

    #[error("circuit build failed for {relay}: {reason}")]
    CircuitBuild { relay: String, reason: String },

    #[error("control session lost")]
    SessionLost,
}

/// What the orchestrator does with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Abort the run.
    Fatal,
    /// Log and move on to the next relay.
    SkipRelay,
    /// Relaunch the daemon, then move on to the next relay.
    Relaunch,
}

impl ProbeError {
    pub fn disposition(&self) -> Disposition {
        match self {
            ProbeError::DirectoryFetch(_) | ProbeError::Launch(_) => Disposition::Fatal,
            ProbeError::RelayInfo { .. } | ProbeError::CircuitBuild { .. } => {
                Disposition::SkipRelay
            }
            ProbeError::SessionLost => Disposition::Relaunch,
        }
    }

    /// Map a control-port error raised during a relay info lookup.
    pub fn relay_info(relay: &str, err: ControlError) -> Self {
        if err.is_disconnect() {
            ProbeError::SessionLost
        } else {
            ProbeError::RelayInfo {
                relay: relay.to_string(),
                reason: err.to_string(),
            }
        }
    }

    /// Map a control-port error raised while building a circuit.
    pub fn circuit_build(relay: &str, err: ControlError) -> Self {
        if err.is_disconnect() {
            ProbeError::SessionLost
        } else {
            ProbeError::CircuitBuild {
                relay: relay.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

impl From<reqwest::Error> for ProbeError {
    fn from(err: reqwest::Error) -> Self {
        ProbeError::DirectoryFetch(err.to_string())
    }
}

/// Result type for exitmap operations.
pub type Result<T> = std::result::Result<T, ProbeError>;
