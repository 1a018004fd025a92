//! Error types for tor-control

use thiserror::Error;

/// Errors produced while talking to a Tor daemon over its control port
#[derive(Error, Debug)]
pub enum ControlError {
    /// The control connection is gone (EOF, reset, or the daemon exited).
    ///
    /// Everything derived from the connection is stale once this is seen.
    #[error("Tor control connection closed")]
    Disconnected,

    /// IO error outside the control socket (files, process spawning)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Reply did not follow the control-protocol framing
    #[error("Malformed control reply: {0}")]
    Protocol(String),

    /// Daemon answered with a non-2xx status
    #[error("{command} rejected with {code}: {message}")]
    Rejected {
        command: String,
        code: u16,
        message: String,
    },

    /// Daemon could not be started or never became ready
    #[error("Failed to launch tor: {0}")]
    Launch(String),

    /// Circuit reported FAILED or CLOSED before reaching BUILT
    #[error("Circuit {circuit} failed: {reason}")]
    CircuitFailed { circuit: String, reason: String },
}

impl ControlError {
    /// Whether this error means the control session itself is lost.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ControlError::Disconnected)
    }
}

/// Result type for control-port operations
pub type ControlResult<T> = std::result::Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_disconnected_is_disconnect() {
        assert!(ControlError::Disconnected.is_disconnect());
        assert!(!ControlError::Protocol("bad".to_string()).is_disconnect());
        assert!(!ControlError::CircuitFailed {
            circuit: "7".to_string(),
            reason: "TIMEOUT".to_string(),
        }
        .is_disconnect());
    }

    #[test]
    fn test_rejected_display() {
        let err = ControlError::Rejected {
            command: "GETINFO".to_string(),
            code: 552,
            message: "Unrecognized key \"ns/id/XYZ\"".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("GETINFO"));
        assert!(msg.contains("552"));
    }
}
