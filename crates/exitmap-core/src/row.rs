//! Measurement rows.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::relay::Relay;

/// Status string recorded for a successful fetch.
pub const STATUS_OK: &str = "ok";

/// One (relay, url) measurement. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRow {
    pub fingerprint: String,
    pub nickname: String,
    pub country: String,
    pub asn: String,
    pub url: String,
    /// `"ok"` or the stringified failure
    pub status: String,
    /// Byte length of the decoded body; 0 on failure
    pub response_length: u32,
    pub elapsed: Duration,
    /// When the request was issued
    pub timestamp: DateTime<Utc>,
}

impl MeasurementRow {
    /// Row for a fetch that returned a body.
    pub fn ok(relay: &Relay, url: &str, body_len: usize, elapsed: Duration) -> Self {
        Self::new(
            relay,
            url,
            STATUS_OK.to_string(),
            u32::try_from(body_len).unwrap_or(u32::MAX),
            elapsed,
        )
    }

    /// Row for a fetch that failed in transport or timed out.
    pub fn failed(relay: &Relay, url: &str, reason: String, elapsed: Duration) -> Self {
        Self::new(relay, url, reason, 0, elapsed)
    }

    fn new(relay: &Relay, url: &str, status: String, response_length: u32, elapsed: Duration) -> Self {
        MeasurementRow {
            fingerprint: relay.fingerprint.clone(),
            nickname: relay.nickname.clone(),
            country: relay.country.clone(),
            asn: relay.asn.clone(),
            url: url.to_string(),
            status,
            response_length,
            elapsed,
            timestamp: Utc::now(),
        }
    }

    /// Stamp the row with the time its request was issued.
    pub fn issued_at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_row_copies_relay_context() {
        let relay = Relay::new("exit1", "AB").with_location("de", "AS3320");
        let row = MeasurementRow::ok(&relay, "https://ooni.org/robots.txt", 120, Duration::from_millis(800));
        assert!(row.is_ok());
        assert_eq!(row.response_length, 120);
        assert_eq!(row.country, "de");
        assert_eq!(row.asn, "AS3320");
    }

    #[test]
    fn test_failed_row_has_zero_length() {
        let relay = Relay::new("exit1", "AB");
        let row = MeasurementRow::failed(&relay, "u", "operation timed out".into(), Duration::from_secs(10));
        assert!(!row.is_ok());
        assert_eq!(row.response_length, 0);
        assert_eq!(row.status, "operation timed out");
    }
}
