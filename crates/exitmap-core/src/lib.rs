//! exitmap core library
//!
//! Measures, for every running Tor exit relay, whether a fixed set of URLs
//! can be fetched over a two-hop circuit ending at that relay.
//!
//! ## Key Components
//!
//! - `DirectoryClient`: running exit relays from Onionoo
//! - `SessionManager`: owns the one live daemon session, relaunches it
//! - `CircuitProber`: `[random guard, exit]` circuits with a bounded wait
//! - `UrlFetchRunner`: sequential probes over one circuit
//! - `MeasurementOrchestrator`: the per-relay loop with skip and relaunch
//! - `ResultSink`: CSV, ClickHouse and log destinations for rows

pub mod config;
pub mod directory;
pub mod error;
pub mod fakes;
pub mod fetch;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod prober;
pub mod relay;
pub mod row;
pub mod session;
pub mod sink;
pub mod telemetry;
pub mod tor;

pub use config::{ProbeConfig, TorLaunchConfig, DEFAULT_URLS};
pub use directory::{parse_relays, DirectoryClient, RelayDirectory, DEFAULT_DIRECTORY_URL};
pub use error::{Disposition, ProbeError, Result};
pub use fetch::{FetchError, HttpFetcher, ReqwestFetcher, UrlFetchRunner};
pub use metrics::METRICS;
pub use orchestrator::{MeasurementOrchestrator, RunReport};
pub use prober::{Circuit, CircuitProber};
pub use relay::{prepare_worklist, Relay};
pub use row::MeasurementRow;
pub use session::{ControlSession, DaemonLauncher, SessionManager};
pub use sink::{ClickHouseSink, CsvSink, LogSink, ResultSink, SinkError, SinkResult};
pub use telemetry::init_tracing;
pub use tor::{TorLauncher, TorSession};
