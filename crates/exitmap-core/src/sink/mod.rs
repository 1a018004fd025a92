//! Result sinks.
//!
//! A sink receives the rows of one relay after that relay has completed.
//! Write failures are reported to the caller, which logs and continues.

pub mod clickhouse;
pub mod csv;

use async_trait::async_trait;
use tracing::info;

use crate::row::MeasurementRow;

pub use self::clickhouse::ClickHouseSink;
pub use self::csv::CsvSink;

/// A row could not be persisted. The run logs it and keeps going.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("result sink error: {0}")]
pub struct SinkError(pub String);

impl From<::csv::Error> for SinkError {
    fn from(err: ::csv::Error) -> Self {
        SinkError(err.to_string())
    }
}

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        SinkError(err.to_string())
    }
}

impl From<::clickhouse::error::Error> for SinkError {
    fn from(err: ::clickhouse::error::Error) -> Self {
        SinkError(err.to_string())
    }
}

/// Result type for sink operations.
pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// Destination for measurement rows.
#[async_trait]
pub trait ResultSink: Send {
    /// Persist one row. Must not reorder rows.
    async fn write(&mut self, row: &MeasurementRow) -> SinkResult<()>;

    /// Push anything buffered to durable storage.
    async fn flush(&mut self) -> SinkResult<()> {
        Ok(())
    }
}

/// Logs each row as a structured event; stores nothing.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl ResultSink for LogSink {
    async fn write(&mut self, row: &MeasurementRow) -> SinkResult<()> {
        info!(
            event = "row",
            fingerprint = %row.fingerprint,
            nickname = %row.nickname,
            country = %row.country,
            asn = %row.asn,
            url = %row.url,
            status = %row.status,
            response_length = row.response_length,
            elapsed_ms = row.elapsed.as_millis() as u64,
        );
        Ok(())
    }
}

#[async_trait]
impl<S: ResultSink + ?Sized> ResultSink for Box<S> {
    async fn write(&mut self, row: &MeasurementRow) -> SinkResult<()> {
        (**self).write(row).await
    }

    async fn flush(&mut self) -> SinkResult<()> {
        (**self).flush().await
    }
}
