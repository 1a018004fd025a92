//! Explicit-path circuit construction.

use tracing::debug;

use crate::connection::{ControlConnection, EventStream};
use crate::error::{ControlError, ControlResult};
use crate::state::Router;

/// Daemon-assigned circuit identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CircuitId(pub String);

impl std::fmt::Display for CircuitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Circuit status values carried by `CIRC` events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitStatus {
    Launched,
    Built,
    Extended,
    Failed,
    Closed,
    Other(String),
}

impl CircuitStatus {
    fn parse(s: &str) -> Self {
        match s {
            "LAUNCHED" => CircuitStatus::Launched,
            "BUILT" => CircuitStatus::Built,
            "EXTENDED" => CircuitStatus::Extended,
            "FAILED" => CircuitStatus::Failed,
            "CLOSED" => CircuitStatus::Closed,
            other => CircuitStatus::Other(other.to_string()),
        }
    }
}

/// A parsed `650 CIRC` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitEvent {
    pub id: CircuitId,
    pub status: CircuitStatus,
    pub reason: Option<String>,
}

impl CircuitEvent {
    /// Parse the text of a `CIRC` event line; `None` for other events.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        if parts.next()? != "CIRC" {
            return None;
        }
        let id = CircuitId(parts.next()?.to_string());
        let status = CircuitStatus::parse(parts.next()?);
        let reason = parts
            .find_map(|p| p.strip_prefix("REASON="))
            .map(str::to_string);
        Some(CircuitEvent { id, status, reason })
    }
}

/// A circuit whose construction was requested but not yet confirmed.
///
/// The event subscription is taken before the request so that a fast
/// `BUILT` cannot be missed.
pub struct PendingCircuit {
    pub id: CircuitId,
    events: EventStream,
}

impl PendingCircuit {
    /// Wait until the circuit is BUILT, or report why it never will be.
    ///
    /// No timeout here; callers bound the wait.
    pub async fn when_built(mut self) -> ControlResult<CircuitId> {
        loop {
            let reply = self.events.recv().await?;
            let Some(event) = CircuitEvent::parse(reply.first_text()) else {
                continue;
            };
            if event.id != self.id {
                continue;
            }
            match event.status {
                CircuitStatus::Built => return Ok(self.id),
                CircuitStatus::Failed | CircuitStatus::Closed => {
                    return Err(ControlError::CircuitFailed {
                        circuit: self.id.0,
                        reason: event.reason.unwrap_or_else(|| "unknown".to_string()),
                    });
                }
                _ => {}
            }
        }
    }
}

/// `EXTENDCIRCUIT 0 <path>`: build a new circuit over exactly `path`,
/// bypassing the daemon's own guard selection.
pub async fn extend_circuit(
    conn: &ControlConnection,
    path: &[Router],
) -> ControlResult<PendingCircuit> {
    if path.is_empty() {
        return Err(ControlError::Protocol("empty circuit path".to_string()));
    }
    let events = conn.subscribe();
    let hops = path
        .iter()
        .map(|r| r.id_hex())
        .collect::<Vec<_>>()
        .join(",");
    let reply = conn
        .command(&format!("EXTENDCIRCUIT 0 {hops} purpose=general"))
        .await?;

    let id = reply
        .first_text()
        .strip_prefix("EXTENDED ")
        .map(|id| CircuitId(id.trim().to_string()))
        .ok_or_else(|| {
            ControlError::Protocol(format!("unexpected EXTENDCIRCUIT reply: {}", reply.message()))
        })?;
    debug!(circuit = %id, path = %hops, "circuit requested");
    Ok(PendingCircuit { id, events })
}
