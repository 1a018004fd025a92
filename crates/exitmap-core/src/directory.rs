//! Relay directory client (Onionoo).
//!
//! One GET against the directory, strict parsing, running-only filter and
//! an optional shuffle. No retry: a failed fetch ends the run.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use tracing::debug;

use crate::error::{ProbeError, Result};
use crate::relay::{prepare_worklist, Relay};

/// Onionoo details query for relays with the Exit flag.
pub const DEFAULT_DIRECTORY_URL: &str = "https://onionoo.torproject.org/details?search=flag:Exit";

/// Source of the relay worklist.
#[async_trait]
pub trait RelayDirectory: Send + Sync {
    /// Running exit relays, shuffled when `randomize` is set.
    async fn fetch(&self, randomize: bool) -> Result<Vec<Relay>>;
}

#[derive(Debug, Deserialize)]
struct DetailsDocument {
    relays: Vec<DetailsRelay>,
}

#[derive(Debug, Deserialize)]
struct DetailsRelay {
    nickname: String,
    fingerprint: String,
    country: String,
    #[serde(rename = "as")]
    asn: String,
    running: bool,
}

/// Parse an Onionoo details document into relay records, in document order.
///
/// Every entry must carry `nickname`, `fingerprint`, `country`, `as` and
/// `running`; non-running relays are kept here and dropped by the worklist.
pub fn parse_relays(body: &[u8]) -> Result<Vec<Relay>> {
    let doc: DetailsDocument = serde_json::from_slice(body)
        .map_err(|e| ProbeError::DirectoryFetch(format!("malformed directory payload: {e}")))?;
    Ok(doc
        .relays
        .into_iter()
        .map(|r| Relay {
            nickname: r.nickname,
            fingerprint: r.fingerprint,
            country: r.country,
            asn: r.asn,
            running: r.running,
        })
        .collect())
}

/// HTTP directory client.
pub struct DirectoryClient {
    http: reqwest::Client,
    url: String,
    rng: Mutex<StdRng>,
}

impl DirectoryClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        Self::with_rng(url, timeout, StdRng::from_entropy())
    }

    /// Client with an explicit RNG for the shuffle.
    pub fn with_rng(url: &str, timeout: Duration, rng: StdRng) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("exitmap/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(DirectoryClient {
            http,
            url: url.to_string(),
            rng: Mutex::new(rng),
        })
    }
}

#[async_trait]
impl RelayDirectory for DirectoryClient {
    async fn fetch(&self, randomize: bool) -> Result<Vec<Relay>> {
        let started = Instant::now();
        debug!(url = %self.url, "fetching relay directory");

        let body = self
            .http
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let relays = parse_relays(&body)?;
        let total = relays.len();

        let worklist = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            prepare_worklist(relays, randomize, &mut *rng)
        };
        crate::obs::emit_directory_fetched(
            total,
            worklist.len(),
            started.elapsed().as_millis() as u64,
        );
        Ok(worklist)
    }
}
