//! Network-state view derived from the daemon after bootstrap.
//!
//! Routers come from `GETINFO ns/all`, keyed by `"$" + FINGERPRINT`. The
//! guard set comes from `GETINFO entry-guards`.

use std::collections::HashMap;
use std::net::IpAddr;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::connection::ControlConnection;
use crate::error::ControlResult;

/// A relay as known to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    /// Uppercase hex identity fingerprint (40 chars)
    pub fingerprint: String,
    pub nickname: String,
    pub address: Option<IpAddr>,
    pub flags: Vec<String>,
}

impl Router {
    /// Router known only by fingerprint (e.g. a guard missing from ns/all).
    pub fn bare(fingerprint: &str, nickname: &str) -> Self {
        Router {
            fingerprint: fingerprint.to_ascii_uppercase(),
            nickname: nickname.to_string(),
            address: None,
            flags: Vec::new(),
        }
    }

    /// Key used in `routers_by_hash`.
    pub fn id_hex(&self) -> String {
        format!("${}", self.fingerprint)
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }
}

impl std::fmt::Display for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.address {
            Some(ip) => write!(f, "{}", ip),
            None => write!(f, "{}", self.nickname),
        }
    }
}

/// Daemon's view of the network at session creation.
#[derive(Debug, Clone, Default)]
pub struct NetworkState {
    pub routers_by_hash: HashMap<String, Router>,
    pub guards: HashMap<String, Router>,
}

impl NetworkState {
    /// Query the daemon and build the view.
    pub async fn create(conn: &ControlConnection) -> ControlResult<Self> {
        let ns_all = conn.get_info("ns/all").await?;
        let routers_by_hash = parse_ns_all(&ns_all);
        let entry_guards = conn.get_info("entry-guards").await?;
        let guards = parse_entry_guards(&entry_guards)
            .into_iter()
            .map(|guard| {
                let key = guard.id_hex();
                let router = routers_by_hash.get(&key).cloned().unwrap_or(guard);
                (key, router)
            })
            .collect::<HashMap<_, _>>();

        debug!(
            routers = routers_by_hash.len(),
            guards = guards.len(),
            "network state created"
        );
        Ok(NetworkState {
            routers_by_hash,
            guards,
        })
    }

    /// Look up by fingerprint, with or without the leading `$`.
    pub fn router(&self, fingerprint: &str) -> Option<&Router> {
        let fingerprint = fingerprint.trim_start_matches('$');
        self.routers_by_hash
            .get(&format!("${}", fingerprint.to_ascii_uppercase()))
    }
}

/// Parse router status entries (`r` and `s` lines).
pub fn parse_ns_all(text: &str) -> HashMap<String, Router> {
    let mut routers = HashMap::new();
    let mut current: Option<Router> = None;

    for line in text.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("r") => {
                if let Some(router) = current.take() {
                    routers.insert(router.id_hex(), router);
                }
                let fields: Vec<&str> = parts.collect();
                if fields.len() < 2 {
                    warn!(line, "short router status line");
                    continue;
                }
                let Some(fingerprint) = identity_to_fingerprint(fields[1]) else {
                    warn!(identity = fields[1], "undecodable router identity");
                    continue;
                };
                let address = fields[2..].iter().find_map(|f| f.parse::<IpAddr>().ok());
                current = Some(Router {
                    fingerprint,
                    nickname: fields[0].to_string(),
                    address,
                    flags: Vec::new(),
                });
            }
            Some("s") => {
                if let Some(router) = current.as_mut() {
                    router.flags = parts.map(str::to_string).collect();
                }
            }
            _ => {}
        }
    }
    if let Some(router) = current.take() {
        routers.insert(router.id_hex(), router);
    }
    routers
}

/// Decode a base64 identity digest into an uppercase hex fingerprint.
pub fn identity_to_fingerprint(identity: &str) -> Option<String> {
    let bytes = STANDARD_NO_PAD
        .decode(identity.trim_end_matches('='))
        .ok()?;
    if bytes.len() != 20 {
        return None;
    }
    Some(hex::encode_upper(bytes))
}

/// Parse `entry-guards` lines: `$FP~nick status`, `$FP=nick status` or `FP status`.
///
/// Guards reported `down` or `unusable` are left out.
pub fn parse_entry_guards(text: &str) -> Vec<Router> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?;
            let status = parts.next().unwrap_or("up");
            if matches!(status, "down" | "unusable") {
                return None;
            }
            let name = name.trim_start_matches('$');
            let (fingerprint, nickname) = match name.find(['~', '=']) {
                Some(idx) => (&name[..idx], &name[idx + 1..]),
                None => (name, ""),
            };
            if fingerprint.len() != 40 || !fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
                return None;
            }
            Some(Router::bare(fingerprint, nickname))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // 20 bytes 0x00..0x13
    const IDENTITY: &str = "AAECAwQFBgcICQoLDA0ODxAREhM";
    const FINGERPRINT: &str = "000102030405060708090A0B0C0D0E0F10111213";

    #[test]
    fn test_identity_to_fingerprint() {
        assert_eq!(identity_to_fingerprint(IDENTITY).as_deref(), Some(FINGERPRINT));
        assert_eq!(identity_to_fingerprint("short"), None);
    }

    #[test]
    fn test_parse_ns_all_with_flags() {
        let text = format!(
            "r exit1 {IDENTITY} 2024-01-01 00:00:00 192.0.2.7 9001 0\n\
             s Exit Fast Running Valid\n\
             w Bandwidth=100\n"
        );
        let routers = parse_ns_all(&text);
        let router = routers.get(&format!("${FINGERPRINT}")).expect("router");
        assert_eq!(router.nickname, "exit1");
        assert_eq!(router.address, Some("192.0.2.7".parse().unwrap()));
        assert!(router.has_flag("Exit"));
        assert!(!router.has_flag("Guard"));
    }

    #[test]
    fn test_parse_ns_all_skips_bad_identity() {
        let routers = parse_ns_all("r broken !!! 1.2.3.4\ns Exit\n");
        assert!(routers.is_empty());
    }

    #[test]
    fn test_parse_entry_guards_filters_down() {
        let text = format!(
            "${FINGERPRINT}~guard1 up\n\
             $FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF=guard2 down 2024-01-01\n\
             $AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA~guard3 never-connected\n\
             garbage\n"
        );
        let guards = parse_entry_guards(&text);
        assert_eq!(guards.len(), 2);
        assert_eq!(guards[0].fingerprint, FINGERPRINT);
        assert_eq!(guards[0].nickname, "guard1");
        assert_eq!(guards[1].nickname, "guard3");
    }

    #[test]
    fn test_router_names() {
        let router = Router::bare("abcdef0123456789abcdef0123456789abcdef01", "nick");
        assert_eq!(router.id_hex(), "$ABCDEF0123456789ABCDEF0123456789ABCDEF01");
        assert_eq!(router.to_string(), "nick");
    }
}
