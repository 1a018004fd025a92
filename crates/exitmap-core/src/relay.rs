//! Relay records and worklist preparation.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// An exit relay as published by the directory. Immutable for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    pub nickname: String,
    /// 40 hex chars, unique
    pub fingerprint: String,
    pub country: String,
    pub asn: String,
    pub running: bool,
}

impl Relay {
    pub fn new(nickname: &str, fingerprint: &str) -> Self {
        Relay {
            nickname: nickname.to_string(),
            fingerprint: fingerprint.to_string(),
            country: String::new(),
            asn: String::new(),
            running: true,
        }
    }

    pub fn with_location(mut self, country: &str, asn: &str) -> Self {
        self.country = country.to_string();
        self.asn = asn.to_string();
        self
    }
}

/// Keep running relays only and optionally shuffle them.
///
/// With `randomize == false` the input order is preserved exactly.
pub fn prepare_worklist<R: Rng + ?Sized>(
    relays: Vec<Relay>,
    randomize: bool,
    rng: &mut R,
) -> Vec<Relay> {
    let mut worklist: Vec<Relay> = relays.into_iter().filter(|r| r.running).collect();
    if randomize {
        worklist.shuffle(rng);
    }
    worklist
}
