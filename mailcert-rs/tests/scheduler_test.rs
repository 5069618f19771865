//! Integration tests for renewal runs

mod common;

use chrono::{Duration, Utc};
use common::{capture_logs, write_cert, Harness};
use mailcert_rs::acme::Certbot;
use mailcert_rs::lock::RunLock;
use mailcert_rs::scheduler::RenewalOutcome;
use mailcert_rs::store::KEY_FILE;
use mailcert_rs::types::ChallengeMethod;
use mailcert_rs::{Coordinator, RunReport};
use std::sync::Arc;

fn seed(harness: &Harness, mail_days: i64, apex_days: i64) {
    let now = Utc::now();
    write_cert(&harness.cert_root(), "mail.example.com", now + Duration::days(mail_days));
    write_cert(&harness.cert_root(), "example.com", now + Duration::days(apex_days));
}

#[tokio::test]
async fn test_nothing_due_means_no_window_and_no_acme() {
    let harness = Harness::new(true, true);
    seed(&harness, 30, 45);

    let report = harness.coordinator().renew().await.unwrap();

    assert!(matches!(report, RunReport::NothingToDo));
    assert_eq!(harness.acme.call_count(), 0);
    assert_eq!(harness.daemon.stops(), 0);
    assert_eq!(harness.daemon.reloads(), 0);
}

#[tokio::test]
async fn test_due_domains_renewed_in_one_window() {
    let harness = Harness::new(true, true);
    seed(&harness, 3, 5);

    let report = harness.coordinator().renew().await.unwrap();

    let attempt = match report {
        RunReport::Renewed(attempt) => attempt,
        other => panic!("unexpected report: {:?}", other),
    };
    assert_eq!(attempt.outcome, RenewalOutcome::Success);
    assert_eq!(
        attempt.method,
        Some(ChallengeMethod::TlsAlpn01 { port: 587 })
    );
    assert_eq!(attempt.windows.len(), 1);
    assert!(attempt.port_released_at.is_some());
    assert!(attempt.port_reacquired_at.is_some());

    // One window, one ACME call covering both domains
    assert_eq!(harness.daemon.stops(), 1);
    assert_eq!(harness.daemon.starts(), 1);
    assert_eq!(harness.acme.call_count(), 1);
    assert_eq!(harness.acme.calls()[0].0.len(), 2);

    let deployment = attempt.deployment.unwrap();
    assert_eq!(deployment.domains.len(), 2);
    assert!(deployment.reloaded);
    assert_eq!(harness.daemon.reloads(), 1);
    assert!(harness
        .main_cf()
        .contains("certs/mail.example.com/fullchain.pem"));
}

#[tokio::test]
async fn test_only_due_domains_are_renewed() {
    let harness = Harness::new(true, true);
    seed(&harness, 3, 30);

    harness.coordinator().renew().await.unwrap();

    assert_eq!(
        harness.acme.calls()[0].0,
        vec!["mail.example.com".to_string()]
    );
}

#[tokio::test]
async fn test_second_run_is_idle() {
    let harness = Harness::new(true, true);
    seed(&harness, 3, 3);
    let coordinator = harness.coordinator();

    assert!(matches!(
        coordinator.renew().await.unwrap(),
        RunReport::Renewed(_)
    ));
    assert!(matches!(
        coordinator.renew().await.unwrap(),
        RunReport::NothingToDo
    ));
    assert_eq!(harness.acme.call_count(), 1);
    assert_eq!(harness.daemon.stops(), 1);
}

#[tokio::test]
async fn test_fallback_to_http_is_recorded() {
    let harness = Harness::new(false, true);
    seed(&harness, 3, 3);

    let report = harness.coordinator().renew().await.unwrap();

    let attempt = report.attempt().unwrap();
    assert_eq!(attempt.method, Some(ChallengeMethod::Http01 { port: 80 }));
    assert_eq!(attempt.attempts.len(), 3);
    assert_eq!(harness.daemon.starts(), 1);
}

#[tokio::test]
async fn test_smtps_port_used_when_submission_fails() {
    let harness = Harness::new(true, true);
    harness.acme.fail_port(587);
    seed(&harness, 3, 3);

    let report = harness.coordinator().renew().await.unwrap();

    let attempt = match report {
        RunReport::Renewed(attempt) => attempt,
        other => panic!("unexpected report: {:?}", other),
    };
    assert_eq!(attempt.method, Some(ChallengeMethod::TlsAlpn01 { port: 465 }));
    assert_eq!(attempt.attempts.len(), 2);
    assert!(!attempt.attempts[0].succeeded);
    assert!(attempt.attempts[1].succeeded);

    // Both ports tried inside a single stop/start window
    assert_eq!(attempt.windows.len(), 1);
    assert_eq!(harness.daemon.stops(), 1);
    assert_eq!(harness.daemon.starts(), 1);
    assert_eq!(
        harness.journal.entries(),
        vec!["stop", "acme:tls-alpn-01", "acme:tls-alpn-01", "start", "reload"]
    );
}

#[tokio::test]
async fn test_exhausted_run_deploys_nothing() {
    let harness = Harness::new(false, false);
    seed(&harness, 3, 3);

    let report = harness.coordinator().renew().await.unwrap();

    assert!(report.is_failure());
    let attempt = report.attempt().unwrap();
    assert_eq!(attempt.outcome, RenewalOutcome::ExhaustedFailure);
    assert_eq!(attempt.method, None);
    assert!(attempt.deployment.is_none());

    assert_eq!(harness.daemon.starts(), 1);
    assert!(harness.daemon.running());
    assert_eq!(harness.daemon.reloads(), 0);
    assert!(harness.main_cf().is_empty());

    // Nothing was marked renewed: the next run tries again
    let again = harness.coordinator().renew().await.unwrap();
    assert!(again.is_failure());
    assert_eq!(harness.acme.call_count(), 6);
}

#[tokio::test]
async fn test_client_leaving_certificate_unchanged_is_a_failure() {
    let mut harness = Harness::new(true, true);
    harness.settings.tls.certbot_path = "true".to_string();
    seed(&harness, 3, 3);
    let certbot = Arc::new(Certbot::from_settings(&harness.settings));
    let coordinator = Coordinator::with_components(
        harness.settings.clone(),
        harness.daemon.clone(),
        harness.probe.clone(),
        certbot,
    );

    let first = coordinator.renew().await.unwrap();
    assert!(first.is_failure());
    assert!(first.attempt().unwrap().deployment.is_none());
    assert_eq!(harness.daemon.reloads(), 0);
    assert!(harness.main_cf().is_empty());

    // Still due, so the next pass tries again rather than reporting idle
    let second = coordinator.renew().await.unwrap();
    assert!(second.is_failure());
    assert_eq!(harness.daemon.stops(), 2);
    assert_eq!(harness.daemon.starts(), 2);
    assert!(harness.daemon.running());
}

#[tokio::test]
async fn test_key_without_chain_is_renewed() {
    let harness = Harness::new(true, true);
    seed(&harness, 60, 60);
    let dir = harness.cert_root().join("example.com");
    std::fs::remove_file(dir.join("fullchain.pem")).unwrap();
    assert!(dir.join(KEY_FILE).exists());

    let (logs, _guard) = capture_logs();
    let report = harness.coordinator().renew().await.unwrap();

    assert!(matches!(report, RunReport::Renewed(_)));
    assert_eq!(harness.acme.calls()[0].0, vec!["example.com".to_string()]);

    let logs = logs.contents();
    let warning = logs
        .lines()
        .find(|line| line.contains("No usable certificate, treating as due"))
        .expect("missing material was not logged");
    assert!(warning.contains("WARN"));
    assert!(warning.contains("example.com"));
}

#[tokio::test]
async fn test_missing_material_is_renewed() {
    let harness = Harness::new(true, true);

    let report = harness.coordinator().renew().await.unwrap();

    assert!(matches!(report, RunReport::Renewed(_)));
    assert_eq!(harness.acme.calls()[0].0.len(), 2);
}

#[tokio::test]
async fn test_held_lock_skips_run() {
    let harness = Harness::new(true, true);
    seed(&harness, 3, 3);
    let _held = RunLock::try_acquire(&harness.settings.renewal.lock_file)
        .unwrap()
        .unwrap();

    let report = harness.coordinator().renew().await.unwrap();

    assert!(matches!(report, RunReport::Skipped));
    assert_eq!(harness.acme.call_count(), 0);
    assert_eq!(harness.daemon.stops(), 0);
}

#[tokio::test]
async fn test_daemon_left_down_is_an_error() {
    let harness = Harness::new(true, true);
    harness.daemon.break_restart();
    seed(&harness, 3, 3);

    let result = harness.coordinator().renew().await;

    assert!(result.unwrap_err().is_fatal());
    assert_eq!(harness.daemon.reloads(), 0);
}

#[tokio::test]
async fn test_loop_stops_on_shutdown() {
    let harness = Harness::new(true, true);
    seed(&harness, 3, 3);

    harness
        .coordinator()
        .run_daemon(std::future::ready(()))
        .await
        .unwrap();

    // One pass ran before the shutdown was noticed
    assert_eq!(harness.acme.call_count(), 1);
}

#[tokio::test]
async fn test_disabled_tls_does_nothing() {
    let mut harness = Harness::new(true, true);
    harness.settings.tls.enabled = false;

    let report = harness.coordinator().renew().await.unwrap();

    assert!(matches!(report, RunReport::NothingToDo));
    assert_eq!(harness.acme.call_count(), 0);
}
