//! URL fetch runner: sequential GETs over one circuit.
//!
//! Every URL yields exactly one row. Transport and timeout failures become
//! the row's status string; a non-2xx response still counts as `ok`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::error::{ProbeError, Result};
use crate::prober::Circuit;
use crate::relay::Relay;
use crate::row::MeasurementRow;
use crate::session::ControlSession;

/// Per-request timeout for URL probes.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport-level fetch failure. Display text is what lands in the row.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct FetchError(pub String);

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError(describe_reqwest_error(&err))
    }
}

fn describe_reqwest_error(err: &reqwest::Error) -> String {
    use std::error::Error as _;

    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// HTTP GET capability bound to a proxy endpoint.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// Fetch `url` and return the decoded body.
    async fn get(&self, url: &str, timeout: Duration) -> std::result::Result<String, FetchError>;
}

/// reqwest client, optionally routed through a SOCKS proxy.
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    /// Client whose connections go through `socks5h://<socks_addr>`.
    ///
    /// A fresh client per circuit keeps pooled connections from leaking
    /// across circuits.
    pub fn via_socks(socks_addr: &str) -> std::result::Result<Self, FetchError> {
        let proxy = reqwest::Proxy::all(format!("socks5h://{socks_addr}"))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .user_agent(concat!("exitmap/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(ReqwestFetcher { client })
    }

    /// Client without a proxy.
    pub fn direct() -> std::result::Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .user_agent(concat!("exitmap/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(ReqwestFetcher { client })
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn get(&self, url: &str, timeout: Duration) -> std::result::Result<String, FetchError> {
        let response = self.client.get(url).timeout(timeout).send().await?;
        Ok(response.text().await?)
    }
}

/// Issues the configured URLs over a built circuit.
pub struct UrlFetchRunner {
    timeout: Duration,
}

impl Default for UrlFetchRunner {
    fn default() -> Self {
        Self::new(DEFAULT_FETCH_TIMEOUT)
    }
}

impl UrlFetchRunner {
    pub fn new(timeout: Duration) -> Self {
        UrlFetchRunner { timeout }
    }

    /// One row per URL, in URL order.
    ///
    /// Fails only with `SessionLost`, checked before each URL and once more
    /// after the last one. Rows gathered for this relay are then dropped with
    /// the error.
    pub async fn run(
        &self,
        session: &dyn ControlSession,
        circuit: &Circuit,
        relay: &Relay,
        urls: &[String],
    ) -> Result<Vec<MeasurementRow>> {
        let mut rows = Vec::with_capacity(urls.len());
        for url in urls {
            if !session.is_connected() {
                return Err(ProbeError::SessionLost);
            }
            rows.push(self.fetch_one(circuit.fetcher.as_ref(), relay, url).await);
        }
        if !session.is_connected() {
            return Err(ProbeError::SessionLost);
        }
        Ok(rows)
    }

    async fn fetch_one(&self, fetcher: &dyn HttpFetcher, relay: &Relay, url: &str) -> MeasurementRow {
        info!(url = %url, relay = %relay.fingerprint, "fetching {} over {}", url, relay.fingerprint);
        let issued_at = Utc::now();
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, fetcher.get(url, self.timeout)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError(format!(
                "timed out after {}s",
                self.timeout.as_secs()
            ))),
        };
        let elapsed = started.elapsed();

        let row = match outcome {
            Ok(body) => MeasurementRow::ok(relay, url, body.len(), elapsed),
            Err(e) => MeasurementRow::failed(relay, url, e.to_string(), elapsed),
        }
        .issued_at(issued_at);
        crate::obs::emit_url_fetched(&relay.fingerprint, url, &row.status, elapsed.as_millis() as u64);
        crate::metrics::METRICS.inc_urls_fetched(row.is_ok());
        row
    }
}

/// Shared handle type stored in circuits.
pub type SharedFetcher = Arc<dyn HttpFetcher>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{spawn_http_server, FakeFetcher, FakeSession, RelayBehavior, SessionScript};
    use tor_control::{CircuitId, Router};

    fn circuit(fetcher: SharedFetcher) -> Circuit {
        Circuit {
            id: CircuitId("1".into()),
            path: vec![Router::bare(&"A".repeat(40), "g"), Router::bare(&"B".repeat(40), "e")],
            fetcher,
        }
    }

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|u| u.to_string()).collect()
    }

    #[tokio::test]
    async fn test_one_row_per_url_in_order() {
        let fetcher = FakeFetcher::new()
            .respond("u1", Ok("hello".into()))
            .respond("u2", Err("connection refused".into()))
            .respond("u3", Ok("".into()));
        let session = FakeSession::new(SessionScript::default());
        let relay = Relay::new("exit", "EXIT");

        let rows = UrlFetchRunner::default()
            .run(&session, &circuit(Arc::new(fetcher)), &relay, &urls(&["u1", "u2", "u3"]))
            .await
            .unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].url, "u1");
        assert_eq!(rows[0].status, "ok");
        assert_eq!(rows[0].response_length, 5);
        assert_eq!(rows[1].status, "connection refused");
        assert_eq!(rows[1].response_length, 0);
        assert_eq!(rows[2].status, "ok");
        assert_eq!(rows[2].response_length, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_fetch_times_out_into_row() {
        let fetcher = FakeFetcher::new().hang("slow");
        let session = FakeSession::new(SessionScript::default());
        let relay = Relay::new("exit", "EXIT");

        let rows = UrlFetchRunner::new(Duration::from_secs(10))
            .run(&session, &circuit(Arc::new(fetcher)), &relay, &urls(&["slow"]))
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert!(rows[0].status.contains("timed out"));
        assert_eq!(rows[0].response_length, 0);
    }

    #[tokio::test]
    async fn test_row_is_stamped_before_the_request() {
        let fetcher = FakeFetcher::new().hang("slow");
        let session = FakeSession::new(SessionScript::default());
        let relay = Relay::new("exit", "EXIT");

        let before = Utc::now();
        let rows = UrlFetchRunner::new(Duration::from_millis(300))
            .run(&session, &circuit(Arc::new(fetcher)), &relay, &urls(&["slow"]))
            .await
            .unwrap();
        let after = Utc::now();

        assert!(rows[0].timestamp >= before);
        assert!(after - rows[0].timestamp >= chrono::Duration::milliseconds(300));
    }

    #[tokio::test]
    async fn test_session_lost_during_last_url_drops_rows() {
        let script = SessionScript::default().relay("EXIT", RelayBehavior::DisconnectDuringFetch);
        let session = FakeSession::new(script);
        let relay = Relay::new("exit", "EXIT");
        let id = session
            .build_circuit(&[Router::bare("EXIT", "e")])
            .await
            .unwrap();
        let fetcher = session.http_fetcher(&id).unwrap();

        let err = UrlFetchRunner::default()
            .run(&session, &circuit(fetcher), &relay, &urls(&["u1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::SessionLost));
    }

    #[tokio::test]
    async fn test_disconnected_session_is_session_lost() {
        let session = FakeSession::new(SessionScript::default());
        session.disconnect();
        let relay = Relay::new("exit", "EXIT");

        let err = UrlFetchRunner::default()
            .run(&session, &circuit(Arc::new(FakeFetcher::new())), &relay, &urls(&["u1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::SessionLost));
    }

    #[tokio::test]
    async fn test_body_length_counts_bytes() {
        let addr = spawn_http_server(404, "Ünïcode").await;
        let fetcher = ReqwestFetcher::direct().unwrap();
        let session = FakeSession::new(SessionScript::default());
        let relay = Relay::new("exit", "EXIT");

        let rows = UrlFetchRunner::default()
            .run(&session, &circuit(Arc::new(fetcher)), &relay, &urls(&[format!("http://{addr}/robots.txt").as_str()]))
            .await
            .unwrap();

        // Non-2xx is still a completed fetch
        assert_eq!(rows[0].status, "ok");
        assert_eq!(rows[0].response_length, "Ünïcode".len() as u32);
    }

    #[tokio::test]
    async fn test_connection_refused_recorded() {
        // Bind and drop to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let fetcher = ReqwestFetcher::direct().unwrap();
        let session = FakeSession::new(SessionScript::default());
        let relay = Relay::new("exit", "EXIT");

        let rows = UrlFetchRunner::default()
            .run(&session, &circuit(Arc::new(fetcher)), &relay, &urls(&[format!("http://127.0.0.1:{port}/").as_str()]))
            .await
            .unwrap();
        assert_ne!(rows[0].status, "ok");
        assert_eq!(rows[0].response_length, 0);
    }
}
