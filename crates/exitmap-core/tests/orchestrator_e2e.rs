//! End-to-end orchestrator scenarios against in-memory fakes.

use exitmap_core::fakes::{
    FakeFetcher, FakeLauncher, MemorySink, RelayBehavior, SessionScript, StaticDirectory,
};
use exitmap_core::{MeasurementOrchestrator, ProbeConfig, ProbeError, Relay};
use rand::rngs::StdRng;
use rand::SeedableRng;

const URL: &str = "https://ooni.org/robots.txt";

fn fp(c: char) -> String {
    c.to_string().repeat(40)
}

fn relays(chars: &str) -> Vec<Relay> {
    chars
        .chars()
        .map(|c| Relay::new(&format!("relay{c}"), &fp(c)).with_location("de", "AS3320"))
        .collect()
}

fn config(urls: &[&str]) -> ProbeConfig {
    ProbeConfig {
        randomize: false,
        urls: urls.iter().map(|u| u.to_string()).collect(),
        ..ProbeConfig::default()
    }
}

fn orchestrator(
    relays: Vec<Relay>,
    launcher: FakeLauncher,
    sink: MemorySink,
    urls: &[&str],
) -> MeasurementOrchestrator<StaticDirectory, FakeLauncher, MemorySink> {
    MeasurementOrchestrator::with_rng(
        StaticDirectory::new(relays),
        launcher,
        sink,
        &config(urls),
        StdRng::seed_from_u64(7),
    )
}

/// R1 answers, R2's requests never complete: exactly two rows.
#[tokio::test(start_paused = true)]
async fn test_second_relay_timeout_yields_two_rows() {
    let script = SessionScript::default()
        .fetcher(FakeFetcher::new().respond(URL, Ok("User-agent: *\nDisallow: /\n".into())))
        .relay(&fp('B'), RelayBehavior::FetchHangs);
    let sink = MemorySink::new();
    let mut run = orchestrator(
        relays("AB"),
        FakeLauncher::new(vec![script]),
        sink.clone(),
        &[URL],
    );

    let report = run.run().await.unwrap();

    let rows = sink.rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].fingerprint, fp('A'));
    assert_eq!(rows[0].status, "ok");
    assert_eq!(rows[0].response_length, 26);
    assert_eq!(rows[1].fingerprint, fp('B'));
    assert!(rows[1].status.contains("timed out"));
    assert_eq!(rows[1].response_length, 0);
    assert_eq!(report.relays_measured, 2);
    assert_eq!(report.relaunches, 0);
}

#[tokio::test]
async fn test_session_loss_relaunches_and_resumes_at_next_relay() {
    let lost = fp('B');
    let script = SessionScript::default().relay(&lost, RelayBehavior::DisconnectDuringFetch);
    let sink = MemorySink::new();
    let launcher = FakeLauncher::new(vec![script, SessionScript::default()]);
    let mut run = orchestrator(relays("ABC"), launcher, sink.clone(), &[URL, "https://www.bbc.com/robots.txt"]);

    let report = run.run().await.unwrap();

    assert_eq!(report.relaunches, 1);
    assert_eq!(run.launcher().launch_attempts(), 2);
    let fingerprints: Vec<String> = sink.rows().iter().map(|r| r.fingerprint.clone()).collect();
    assert_eq!(fingerprints, vec![fp('A'), fp('A'), fp('C'), fp('C')]);
    assert!(!fingerprints.contains(&lost));
}

#[tokio::test]
async fn test_session_lost_on_only_url_drops_that_relay() {
    let script = SessionScript::default().relay(&fp('A'), RelayBehavior::DisconnectDuringFetch);
    let sink = MemorySink::new();
    let launcher = FakeLauncher::new(vec![script, SessionScript::default()]);
    let mut run = orchestrator(relays("ABC"), launcher, sink.clone(), &[URL]);

    let report = run.run().await.unwrap();

    let fingerprints: Vec<String> = sink.rows().iter().map(|r| r.fingerprint.clone()).collect();
    assert_eq!(fingerprints, vec![fp('B'), fp('C')]);
    assert_eq!(report.relaunches, 1);
    assert_eq!(report.relays_measured, 2);
}

#[tokio::test]
async fn test_session_lost_while_building_resumes_at_next_relay() {
    for behavior in [RelayBehavior::DisconnectOnBuild, RelayBehavior::DisconnectWhileBuilding] {
        let script = SessionScript::default().relay(&fp('B'), behavior);
        let sink = MemorySink::new();
        let launcher = FakeLauncher::new(vec![script, SessionScript::default()]);
        let mut run = orchestrator(relays("ABC"), launcher, sink.clone(), &[URL]);

        let report = run.run().await.unwrap();

        let fingerprints: Vec<String> = sink.rows().iter().map(|r| r.fingerprint.clone()).collect();
        assert_eq!(fingerprints, vec![fp('A'), fp('C')], "{behavior:?}");
        assert_eq!(report.relaunches, 1);
        assert_eq!(report.relays_skipped, 0);
        assert_eq!(run.launcher().launch_attempts(), 2);
    }
}

#[tokio::test]
async fn test_build_attempts_bounded_by_worklist() {
    let script = SessionScript::default()
        .relay(&fp('A'), RelayBehavior::BuildFails)
        .relay(&fp('C'), RelayBehavior::DisconnectOnBuild);
    let launcher = FakeLauncher::new(vec![script, SessionScript::default()]);
    let mut run = orchestrator(relays("ABCDE"), launcher, MemorySink::new(), &[URL]);

    let report = run.run().await.unwrap();
    assert_eq!(report.relays_attempted, 5);
    assert!(run.launcher().build_attempts() <= 5);
}

#[tokio::test]
async fn test_build_failure_writes_no_rows() {
    let failed = fp('A');
    let script = SessionScript::default().relay(&failed, RelayBehavior::BuildFails);
    let sink = MemorySink::new();
    let mut run = orchestrator(
        relays("AB"),
        FakeLauncher::new(vec![script]),
        sink.clone(),
        &[URL],
    );

    let report = run.run().await.unwrap();
    assert_eq!(report.relays_skipped, 1);
    assert_eq!(report.relaunches, 0);
    assert!(sink.rows().iter().all(|r| r.fingerprint != failed));
    assert_eq!(sink.rows().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_circuit_that_never_builds_is_skipped() {
    let script = SessionScript::default().relay(&fp('A'), RelayBehavior::NeverBuilt);
    let sink = MemorySink::new();
    let mut run = orchestrator(
        relays("AB"),
        FakeLauncher::new(vec![script]),
        sink.clone(),
        &[URL],
    );

    let report = run.run().await.unwrap();
    assert_eq!(report.relays_skipped, 1);
    assert_eq!(sink.rows().len(), 1);
    assert_eq!(sink.rows()[0].fingerprint, fp('B'));
}

#[tokio::test]
async fn test_relaunch_failure_is_fatal() {
    let script = SessionScript::default().relay(&fp('A'), RelayBehavior::DisconnectOnInfo);
    let launcher = FakeLauncher::new(vec![script]).fail_from(1);
    let sink = MemorySink::new();
    let mut run = orchestrator(relays("AB"), launcher, sink.clone(), &[URL]);

    let err = run.run().await.unwrap_err();
    assert!(matches!(err, ProbeError::Launch(_)));
    assert!(sink.rows().is_empty());
    assert!(run.launcher().is_closed());
}

#[tokio::test]
async fn test_initial_launch_failure_is_fatal() {
    let launcher = FakeLauncher::new(vec![SessionScript::default()]).fail_from(0);
    let mut run = orchestrator(relays("A"), launcher, MemorySink::new(), &[URL]);
    let err = run.run().await.unwrap_err();
    assert!(matches!(err, ProbeError::Launch(_)));
    assert_eq!(run.launcher().build_attempts(), 0);
}

#[tokio::test]
async fn test_fetch_errors_become_rows_not_skips() {
    let script = SessionScript::default().fetcher(
        FakeFetcher::new()
            .respond(URL, Err("connection refused".into()))
            .respond("https://www.apple.com/robots.txt", Ok(String::new())),
    );
    let sink = MemorySink::new();
    let mut run = orchestrator(
        relays("A"),
        FakeLauncher::new(vec![script]),
        sink.clone(),
        &[URL, "https://www.apple.com/robots.txt"],
    );

    let report = run.run().await.unwrap();
    assert_eq!(report.relays_measured, 1);
    let rows = sink.rows();
    assert_eq!(rows[0].status, "connection refused");
    assert_eq!(rows[0].response_length, 0);
    assert_eq!(rows[1].status, "ok");
    assert_eq!(rows[1].response_length, 0);
}

#[tokio::test]
async fn test_randomized_worklist_still_measures_every_relay_once() {
    let sink = MemorySink::new();
    let mut run = MeasurementOrchestrator::with_rng(
        StaticDirectory::new(relays("ABCDEFGH")),
        FakeLauncher::new(vec![SessionScript::default()]),
        sink.clone(),
        &ProbeConfig {
            randomize: true,
            urls: vec![URL.to_string()],
            ..ProbeConfig::default()
        },
        StdRng::seed_from_u64(3),
    );

    run.run().await.unwrap();
    let mut seen: Vec<String> = sink.rows().iter().map(|r| r.fingerprint.clone()).collect();
    seen.sort();
    let expected: Vec<String> = "ABCDEFGH".chars().map(fp).collect();
    assert_eq!(seen, expected);
}
