//! CSV file sink.
//!
//! Header: `fingerprint,nickname,country,asn,url,status,response_length,date`.
//! Every row is flushed as soon as it is written so a crash loses at most
//! the row in flight.

use std::fs::File;
use std::path::Path;

use async_trait::async_trait;

use super::{ResultSink, SinkResult};
use crate::row::MeasurementRow;

pub const CSV_HEADER: [&str; 8] = [
    "fingerprint",
    "nickname",
    "country",
    "asn",
    "url",
    "status",
    "response_length",
    "date",
];

pub struct CsvSink {
    writer: csv::Writer<File>,
}

impl CsvSink {
    /// Create (truncating) `path` and write the header.
    pub fn create(path: &Path) -> SinkResult<Self> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(CSV_HEADER)?;
        writer.flush()?;
        Ok(CsvSink { writer })
    }
}

#[async_trait]
impl ResultSink for CsvSink {
    async fn write(&mut self, row: &MeasurementRow) -> SinkResult<()> {
        let length = row.response_length.to_string();
        let date = row.timestamp.to_rfc3339();
        self.writer
            .write_record([
                row.fingerprint.as_str(),
                row.nickname.as_str(),
                row.country.as_str(),
                row.asn.as_str(),
                row.url.as_str(),
                row.status.as_str(),
                length.as_str(),
                date.as_str(),
            ])?;
        Ok(self.writer.flush()?)
    }

    async fn flush(&mut self) -> SinkResult<()> {
        Ok(self.writer.flush()?)
    }
}
