//! Structured observability hooks for the run lifecycle.
//!
//! Events are emitted at `info!` (failures at `warn!`) with an `event`
//! field so they can be filtered in JSON log pipelines.

use tracing::{info, warn};

/// Span covering the measurement of one relay.
///
/// Attach with `Instrument::instrument`; it is held across awaits.
pub fn relay_span(run_id: &str, fingerprint: &str, nickname: &str) -> tracing::Span {
    tracing::info_span!("exitmap.relay", run_id = %run_id, relay = %fingerprint, nickname = %nickname)
}

pub fn emit_run_started(run_id: &str, relays: usize, urls: usize) {
    info!(event = "run.started", run_id = %run_id, relays = relays, urls = urls);
}

pub fn emit_directory_fetched(total: usize, kept: usize, duration_ms: u64) {
    info!(
        event = "directory.fetched",
        total = total,
        kept = kept,
        duration_ms = duration_ms,
    );
}

pub fn emit_url_fetched(fingerprint: &str, url: &str, status: &str, duration_ms: u64) {
    info!(
        event = "url.fetched",
        relay = %fingerprint,
        url = %url,
        status = %status,
        duration_ms = duration_ms,
    );
}

pub fn emit_relay_measured(fingerprint: &str, rows: usize, duration_ms: u64) {
    info!(
        event = "relay.measured",
        relay = %fingerprint,
        rows = rows,
        duration_ms = duration_ms,
    );
}

/// Relay skipped after a per-relay failure.
pub fn emit_relay_skipped(fingerprint: &str, error: &dyn std::fmt::Display) {
    warn!(event = "relay.skipped", relay = %fingerprint, error = %error, "FAILED to measure via {}", fingerprint);
}

pub fn emit_session_relaunched(fingerprint: &str, launches: u32) {
    warn!(
        event = "session.relaunched",
        relay = %fingerprint,
        launches = launches,
        "control session lost, relaunching tor"
    );
}

pub fn emit_sink_error(fingerprint: &str, url: &str, error: &dyn std::fmt::Display) {
    warn!(event = "sink.error", relay = %fingerprint, url = %url, error = %error);
}

/// Run finished; `success` is false when the run aborted.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, relays_measured: u64, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        relays_measured = relays_measured,
        success = success,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_relay_skipped_keeps_failure_wording() {
        emit_relay_skipped("ABCD", &"circuit build failed");
        assert!(logs_contain("relay.skipped"));
        assert!(logs_contain("FAILED to measure via ABCD"));
    }
}
