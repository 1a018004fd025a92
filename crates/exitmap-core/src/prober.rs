//! Circuit prober: one two-hop circuit per exit relay.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tor_control::{CircuitId, Router};
use tracing::info;

use crate::error::{ProbeError, Result};
use crate::fetch::SharedFetcher;
use crate::relay::Relay;
use crate::session::ControlSession;

pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(60);

/// A built `[guard, exit]` circuit and the HTTP client bound to it.
///
/// Only valid while the session that built it is alive.
pub struct Circuit {
    pub id: CircuitId,
    pub path: Vec<Router>,
    pub fetcher: SharedFetcher,
}

impl Circuit {
    /// `ip -> ip` rendering of the path.
    pub fn path_display(&self) -> String {
        self.path
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

/// Builds circuits with a random guard as the first hop.
pub struct CircuitProber {
    build_timeout: Duration,
    rng: StdRng,
}

impl CircuitProber {
    pub fn new(build_timeout: Duration, rng: StdRng) -> Self {
        CircuitProber { build_timeout, rng }
    }

    /// Build `[random guard, exit]` and wait for it, bounded by the build timeout.
    ///
    /// The `ns/id` and `md/id` lookups prime the daemon's view of the exit;
    /// their values are discarded.
    pub async fn build(&mut self, session: &dyn ControlSession, exit: &Relay) -> Result<Circuit> {
        let fingerprint = exit.fingerprint.to_ascii_uppercase();

        for key in [format!("ns/id/{fingerprint}"), format!("md/id/{fingerprint}")] {
            session
                .get_info(&key)
                .await
                .map_err(|e| ProbeError::relay_info(&fingerprint, e))?;
        }

        let entry = self.pick_guard(session, &fingerprint)?;
        let exit_hop = session
            .router_by_hash(&format!("${fingerprint}"))
            .ok_or_else(|| ProbeError::RelayInfo {
                relay: fingerprint.clone(),
                reason: "not present in network status".to_string(),
            })?;

        info!(
            relay = %fingerprint,
            guard = %entry.fingerprint,
            "Creating a circuit via {} ({})",
            exit.nickname,
            fingerprint
        );
        let path = vec![entry, exit_hop];
        let id = session
            .build_circuit(&path)
            .await
            .map_err(|e| ProbeError::circuit_build(&fingerprint, e))?;

        match tokio::time::timeout(self.build_timeout, session.when_built(&id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ProbeError::circuit_build(&fingerprint, e)),
            Err(_) => {
                return Err(ProbeError::CircuitBuild {
                    relay: fingerprint,
                    reason: format!("not built within {}s", self.build_timeout.as_secs()),
                })
            }
        }

        let fetcher = session
            .http_fetcher(&id)
            .map_err(|e| ProbeError::circuit_build(&fingerprint, e))?;
        let circuit = Circuit { id, path, fetcher };
        info!(circuit = %circuit.id, "path: {}", circuit.path_display());
        Ok(circuit)
    }

    /// Uniform choice among guards that are not the exit itself.
    fn pick_guard(&mut self, session: &dyn ControlSession, exit_fingerprint: &str) -> Result<Router> {
        let candidates: Vec<Router> = session
            .guards()
            .into_iter()
            .filter(|g| g.fingerprint != exit_fingerprint)
            .collect();
        candidates
            .choose(&mut self.rng)
            .cloned()
            .ok_or_else(|| ProbeError::RelayInfo {
                relay: exit_fingerprint.to_string(),
                reason: "guard set is empty".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeSession, RelayBehavior, SessionScript};
    use rand::SeedableRng;

    const EXIT: &str = "EEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEE";

    fn prober(seed: u64) -> CircuitProber {
        CircuitProber::new(Duration::from_secs(60), StdRng::seed_from_u64(seed))
    }

    fn exit() -> Relay {
        Relay::new("exit1", EXIT)
    }

    #[tokio::test]
    async fn test_builds_two_hop_path_ending_at_exit() {
        let session = FakeSession::new(SessionScript::default());
        let circuit = prober(1).build(&session, &exit()).await.unwrap();

        assert_eq!(circuit.path.len(), 2);
        assert_eq!(circuit.path[1].fingerprint, EXIT);
        assert!(session.guard_fingerprints().contains(&circuit.path[0].fingerprint));
        assert_eq!(
            session.info_queries(),
            vec![format!("ns/id/{EXIT}"), format!("md/id/{EXIT}")]
        );
    }

    #[tokio::test]
    async fn test_same_seed_same_guard_sequence() {
        let session = FakeSession::new(SessionScript::default());
        let mut a = prober(9);
        let mut b = prober(9);
        for _ in 0..5 {
            let ga = a.build(&session, &exit()).await.unwrap().path[0].clone();
            let gb = b.build(&session, &exit()).await.unwrap().path[0].clone();
            assert_eq!(ga, gb);
        }
    }

    #[tokio::test]
    async fn test_empty_guard_set_is_relay_info_error() {
        let session = FakeSession::new(SessionScript::without_guards());
        let err = prober(1).build(&session, &exit()).await.err().unwrap();
        assert!(matches!(err, ProbeError::RelayInfo { .. }));
        assert_eq!(session.build_attempts(), 0);
    }

    #[tokio::test]
    async fn test_guard_is_never_the_exit() {
        let script = SessionScript::default().with_guards(&[EXIT]);
        let session = FakeSession::new(script);
        let err = prober(1).build(&session, &exit()).await.err().unwrap();
        assert!(matches!(err, ProbeError::RelayInfo { .. }));
    }

    #[tokio::test]
    async fn test_info_failure_is_relay_info_error() {
        let script = SessionScript::default().relay(EXIT, RelayBehavior::InfoFails);
        let session = FakeSession::new(script);
        let err = prober(1).build(&session, &exit()).await.err().unwrap();
        assert!(matches!(err, ProbeError::RelayInfo { .. }));
    }

    #[tokio::test]
    async fn test_unknown_router_is_relay_info_error() {
        let script = SessionScript::default().relay(EXIT, RelayBehavior::Unknown);
        let session = FakeSession::new(script);
        let err = prober(1).build(&session, &exit()).await.err().unwrap();
        assert!(matches!(err, ProbeError::RelayInfo { .. }));
    }

    #[tokio::test]
    async fn test_daemon_reported_failure_is_circuit_build_error() {
        let script = SessionScript::default().relay(EXIT, RelayBehavior::BuildFails);
        let session = FakeSession::new(script);
        match prober(1).build(&session, &exit()).await.err().unwrap() {
            ProbeError::CircuitBuild { relay, .. } => assert_eq!(relay, EXIT),
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_timeout_is_circuit_build_error() {
        let script = SessionScript::default().relay(EXIT, RelayBehavior::NeverBuilt);
        let session = FakeSession::new(script);
        let err = prober(1).build(&session, &exit()).await.err().unwrap();
        match err {
            ProbeError::CircuitBuild { reason, .. } => assert!(reason.contains("60s")),
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_is_session_lost() {
        for behavior in [
            RelayBehavior::DisconnectOnInfo,
            RelayBehavior::DisconnectOnBuild,
            RelayBehavior::DisconnectWhileBuilding,
        ] {
            let script = SessionScript::default().relay(EXIT, behavior);
            let session = FakeSession::new(script);
            let err = prober(1).build(&session, &exit()).await.err().unwrap();
            assert!(matches!(err, ProbeError::SessionLost));
            assert!(!session.is_connected());
        }
    }
}
