//! Global atomic counters for a measurement run.
//!
//! Counters are incremented at the call site. [`Metrics::flush`] emits the
//! current values as one `tracing::info!` event at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    relays_measured: AtomicU64,
    relays_skipped: AtomicU64,
    relaunches: AtomicU64,
    urls_ok: AtomicU64,
    urls_failed: AtomicU64,
    rows_written: AtomicU64,
    sink_errors: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            relays_measured: AtomicU64::new(0),
            relays_skipped: AtomicU64::new(0),
            relaunches: AtomicU64::new(0),
            urls_ok: AtomicU64::new(0),
            urls_failed: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            sink_errors: AtomicU64::new(0),
        }
    }

    pub fn inc_relays_measured(&self) {
        self.relays_measured.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "relays_measured", "counter incremented");
    }

    pub fn inc_relays_skipped(&self) {
        self.relays_skipped.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "relays_skipped", "counter incremented");
    }

    pub fn inc_relaunches(&self) {
        self.relaunches.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "relaunches", "counter incremented");
    }

    /// Count one completed URL probe, split by outcome.
    pub fn inc_urls_fetched(&self, ok: bool) {
        let counter = if ok { &self.urls_ok } else { &self.urls_failed };
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "urls_fetched", ok, "counter incremented");
    }

    pub fn inc_rows_written(&self) {
        self.rows_written.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "rows_written", "counter incremented");
    }

    pub fn inc_sink_errors(&self) {
        self.sink_errors.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sink_errors", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            relays_measured = self.relays_measured(),
            relays_skipped = self.relays_skipped(),
            relaunches = self.relaunches(),
            urls_ok = self.urls_ok(),
            urls_failed = self.urls_failed(),
            rows_written = self.rows_written(),
            sink_errors = self.sink_errors(),
        );
    }

    pub fn relays_measured(&self) -> u64 {
        self.relays_measured.load(Ordering::Relaxed)
    }

    pub fn relays_skipped(&self) -> u64 {
        self.relays_skipped.load(Ordering::Relaxed)
    }

    pub fn relaunches(&self) -> u64 {
        self.relaunches.load(Ordering::Relaxed)
    }

    pub fn urls_ok(&self) -> u64 {
        self.urls_ok.load(Ordering::Relaxed)
    }

    pub fn urls_failed(&self) -> u64 {
        self.urls_failed.load(Ordering::Relaxed)
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    pub fn sink_errors(&self) -> u64 {
        self.sink_errors.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.relays_measured,
            &self.relays_skipped,
            &self.relaunches,
            &self.urls_ok,
            &self.urls_failed,
            &self.rows_written,
            &self.sink_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
