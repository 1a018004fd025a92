//! Measurement orchestrator.
//!
//! Drains the worklist exactly once, front to back. Per relay: build a
//! circuit, fetch every URL over it, then hand the rows to the sink.
//! Circuit and relay-info failures skip the relay. Losing the control
//! session relaunches the daemon and moves on to the next relay; the relay
//! that was in flight yields no rows. Directory and launch failures abort.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::ProbeConfig;
use crate::directory::RelayDirectory;
use crate::error::{Disposition, ProbeError, Result};
use crate::fetch::UrlFetchRunner;
use crate::metrics::METRICS;
use crate::obs;
use crate::prober::CircuitProber;
use crate::relay::Relay;
use crate::row::MeasurementRow;
use crate::session::{DaemonLauncher, SessionManager};
use crate::sink::ResultSink;

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub relays_attempted: u64,
    pub relays_measured: u64,
    pub relays_skipped: u64,
    pub relaunches: u64,
    pub rows_written: u64,
    pub sink_failures: u64,
    pub duration: Duration,
}

pub struct MeasurementOrchestrator<D, L, S>
where
    D: RelayDirectory,
    L: DaemonLauncher,
    S: ResultSink,
{
    directory: D,
    sessions: SessionManager<L>,
    prober: CircuitProber,
    runner: UrlFetchRunner,
    sink: S,
    urls: Vec<String>,
    randomize: bool,
}

impl<D, L, S> MeasurementOrchestrator<D, L, S>
where
    D: RelayDirectory,
    L: DaemonLauncher,
    S: ResultSink,
{
    pub fn new(directory: D, launcher: L, sink: S, config: &ProbeConfig) -> Self {
        Self::with_rng(directory, launcher, sink, config, StdRng::from_entropy())
    }

    /// Orchestrator whose guard choice is driven by `rng`.
    pub fn with_rng(directory: D, launcher: L, sink: S, config: &ProbeConfig, rng: StdRng) -> Self {
        MeasurementOrchestrator {
            directory,
            sessions: SessionManager::new(launcher),
            prober: CircuitProber::new(config.build_timeout(), rng),
            runner: UrlFetchRunner::new(config.fetch_timeout()),
            sink,
            urls: config.urls.clone(),
            randomize: config.randomize,
        }
    }

    pub fn launcher(&self) -> &L {
        self.sessions.launcher()
    }

    /// Run to completion. The session is shut down on every path.
    pub async fn run(&mut self) -> Result<RunReport> {
        let started = Instant::now();
        let mut report = RunReport {
            run_id: Uuid::new_v4().to_string(),
            ..RunReport::default()
        };

        let result = self.drive(&mut report).await;

        self.sessions.shutdown().await;
        if let Err(e) = self.sink.flush().await {
            obs::emit_sink_error("-", "-", &e);
            report.sink_failures += 1;
            METRICS.inc_sink_errors();
        }
        report.duration = started.elapsed();
        METRICS.flush();
        obs::emit_run_finished(
            &report.run_id,
            report.duration.as_millis() as u64,
            report.relays_measured,
            result.is_ok(),
        );
        result.map(|()| report)
    }

    async fn drive(&mut self, report: &mut RunReport) -> Result<()> {
        let worklist = self.directory.fetch(self.randomize).await?;
        obs::emit_run_started(&report.run_id, worklist.len(), self.urls.len());
        self.sessions.launch().await?;

        for relay in &worklist {
            report.relays_attempted += 1;
            let relay_started = Instant::now();
            let span = obs::relay_span(&report.run_id, &relay.fingerprint, &relay.nickname);

            match self.measure(relay).instrument(span.clone()).await {
                Ok(rows) => {
                    self.record(relay, &rows, report).instrument(span).await;
                    report.relays_measured += 1;
                    METRICS.inc_relays_measured();
                    obs::emit_relay_measured(
                        &relay.fingerprint,
                        rows.len(),
                        relay_started.elapsed().as_millis() as u64,
                    );
                }
                Err(e) => match e.disposition() {
                    Disposition::SkipRelay => {
                        report.relays_skipped += 1;
                        METRICS.inc_relays_skipped();
                        obs::emit_relay_skipped(&relay.fingerprint, &e);
                    }
                    Disposition::Relaunch => {
                        obs::emit_session_relaunched(&relay.fingerprint, self.sessions.launches());
                        self.sessions.launch().await?;
                        report.relaunches += 1;
                        METRICS.inc_relaunches();
                    }
                    Disposition::Fatal => return Err(e),
                },
            }
        }
        Ok(())
    }

    /// Circuit plus fetches for one relay. The circuit is dropped on return.
    async fn measure(&mut self, relay: &Relay) -> Result<Vec<MeasurementRow>> {
        let session = self
            .sessions
            .current_session()
            .ok_or(ProbeError::SessionLost)?;
        let circuit = self.prober.build(session, relay).await?;
        self.runner.run(session, &circuit, relay, &self.urls).await
    }

    async fn record(&mut self, relay: &Relay, rows: &[MeasurementRow], report: &mut RunReport) {
        for row in rows {
            match self.sink.write(row).await {
                Ok(()) => {
                    report.rows_written += 1;
                    METRICS.inc_rows_written();
                }
                Err(e) => {
                    report.sink_failures += 1;
                    METRICS.inc_sink_errors();
                    obs::emit_sink_error(&relay.fingerprint, &row.url, &e);
                }
            }
        }
    }
}
