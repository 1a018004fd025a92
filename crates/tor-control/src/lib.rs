//! tor-control: a small Tor control-port client
//!
//! Provides what a measurement controller needs from a dedicated daemon:
//! launching and bootstrapping it, GETINFO queries, a network-state view,
//! explicit two-hop circuit construction, and attaching SOCKS streams to
//! a chosen circuit.
//!
//! ## Layer 0 - Daemon control
//!
//! Loss of the control connection is surfaced as
//! [`ControlError::Disconnected`] from every pending and future call.

pub mod circuit;
pub mod connection;
pub mod error;
pub mod launch;
pub mod reply;
pub mod state;
pub mod stream;

pub use circuit::{extend_circuit, CircuitEvent, CircuitId, CircuitStatus, PendingCircuit};
pub use connection::{ControlConnection, EventStream};
pub use error::{ControlError, ControlResult};
pub use launch::{LaunchOptions, TorProcess};
pub use reply::{Reply, ReplyLine, ReplyParser};
pub use state::{NetworkState, Router};
pub use stream::{spawn_attacher, AttachTarget, StreamEvent};
