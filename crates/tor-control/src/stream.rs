//! Stream attachment for `__LeaveStreamsUnattached` sessions.
//!
//! With the daemon leaving new SOCKS streams unattached, every `STREAM NEW`
//! event is answered with `ATTACHSTREAM` onto the currently selected
//! circuit, so application traffic only ever leaves through the circuit
//! under measurement.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::circuit::CircuitId;
use crate::connection::ControlConnection;

/// A parsed `650 STREAM` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub stream_id: String,
    pub status: String,
    pub circuit_id: String,
    pub target: String,
}

impl StreamEvent {
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        if parts.next()? != "STREAM" {
            return None;
        }
        Some(StreamEvent {
            stream_id: parts.next()?.to_string(),
            status: parts.next()?.to_string(),
            circuit_id: parts.next()?.to_string(),
            target: parts.next().unwrap_or("").to_string(),
        })
    }

    /// Streams waiting for the controller to pick a circuit.
    pub fn needs_attach(&self) -> bool {
        matches!(self.status.as_str(), "NEW" | "NEWRESOLVE")
    }
}

/// Shared pointer to the circuit new streams should use.
#[derive(Debug, Clone, Default)]
pub struct AttachTarget(Arc<Mutex<Option<CircuitId>>>);

impl AttachTarget {
    pub fn set(&self, circuit: Option<CircuitId>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = circuit;
    }

    pub fn get(&self) -> Option<CircuitId> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Spawn the attacher task. It ends when the connection closes.
///
/// Streams arriving while no circuit is selected are handed back to the
/// daemon with circuit `0`.
pub fn spawn_attacher(conn: Arc<ControlConnection>, target: AttachTarget) -> JoinHandle<()> {
    let mut events = conn.subscribe();
    tokio::spawn(async move {
        while let Ok(reply) = events.recv().await {
            let Some(event) = StreamEvent::parse(reply.first_text()) else {
                continue;
            };
            if !event.needs_attach() {
                continue;
            }
            let circuit = target.get().map(|c| c.0).unwrap_or_else(|| "0".to_string());
            let line = format!("ATTACHSTREAM {} {}", event.stream_id, circuit);
            match conn.command(&line).await {
                Ok(_) => debug!(
                    stream = %event.stream_id,
                    circuit = %circuit,
                    target = %event.target,
                    "stream attached"
                ),
                Err(e) if e.is_disconnect() => break,
                Err(e) => warn!(stream = %event.stream_id, error = %e, "ATTACHSTREAM failed"),
            }
        }
        debug!("stream attacher stopped");
    })
}
