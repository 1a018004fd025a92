//! ClickHouse sink for the `tor_web_connectivity` table.

use async_trait::async_trait;
use clickhouse::{Client, Row};
use serde::Serialize;
use tracing::debug;

use super::{ResultSink, SinkResult};
use crate::row::MeasurementRow;

pub const DEFAULT_TABLE: &str = "tor_web_connectivity";

/// Column layout of `tor_web_connectivity`.
#[derive(Debug, Clone, PartialEq, Row, Serialize)]
pub struct ConnectivityRow {
    /// ClickHouse `DateTime`: seconds since the Unix epoch
    pub date: u32,
    pub fingerprint: String,
    pub nickname: String,
    pub cc: String,
    pub asn: String,
    pub url: String,
    pub status: String,
    pub response_length: u32,
    /// Seconds
    pub timing: f32,
}

impl From<&MeasurementRow> for ConnectivityRow {
    fn from(row: &MeasurementRow) -> Self {
        ConnectivityRow {
            date: u32::try_from(row.timestamp.timestamp()).unwrap_or(0),
            fingerprint: row.fingerprint.clone(),
            nickname: row.nickname.clone(),
            cc: row.country.clone(),
            asn: row.asn.clone(),
            url: row.url.clone(),
            status: row.status.clone(),
            response_length: row.response_length,
            timing: row.elapsed.as_secs_f32(),
        }
    }
}

pub struct ClickHouseSink {
    client: Client,
    table: String,
}

impl ClickHouseSink {
    pub fn new(url: &str, database: &str) -> Self {
        let client = Client::default().with_url(url).with_database(database);
        ClickHouseSink {
            client,
            table: DEFAULT_TABLE.to_string(),
        }
    }

    pub fn with_table(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }
}

#[async_trait]
impl ResultSink for ClickHouseSink {
    async fn write(&mut self, row: &MeasurementRow) -> SinkResult<()> {
        let record = ConnectivityRow::from(row);
        let mut insert = self.client.insert(&self.table)?;
        insert.write(&record).await?;
        insert.end().await?;
        debug!(table = %self.table, url = %record.url, "row inserted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::Relay;
    use chrono::TimeZone;
    use std::time::Duration;

    #[test]
    fn test_row_maps_to_table_columns() {
        let relay = Relay::new("exit1", "AB").with_location("nl", "AS1136");
        let mut row = MeasurementRow::ok(&relay, "https://ooni.org/robots.txt", 42, Duration::from_millis(1500));
        row.timestamp = chrono::Utc.with_ymd_and_hms(1970, 1, 11, 12, 0, 0).unwrap();

        let record = ConnectivityRow::from(&row);
        assert_eq!(record.date, 10 * 86_400 + 12 * 3_600);
        assert_eq!(record.cc, "nl");
        assert_eq!(record.asn, "AS1136");
        assert_eq!(record.response_length, 42);
        assert!((record.timing - 1.5).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_sink_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let relay = Relay::new("exit1", "AB");
        let mut sink = ClickHouseSink::new(&format!("http://127.0.0.1:{port}"), "default");
        let err = sink
            .write(&MeasurementRow::ok(&relay, "u", 1, Duration::ZERO))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("result sink error"));
    }
}
