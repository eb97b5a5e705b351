mod common;

use common::{Op, answer_offline_request, harness};
use keyward_license::backend::{BackendError, Rejection};
use keyward_license::{LicenseError, Timestamp};
use pretty_assertions::assert_eq;

// ── Verified trial ──────────────────────────────────────────────

#[tokio::test]
async fn trial_is_genuine_until_expiry() {
    let h = harness();
    h.engine.set_trial_activation_metadata("source", "website").unwrap();

    h.engine.activate_trial().await.unwrap();

    h.engine.is_trial_genuine().unwrap();
    assert_eq!(h.engine.get_trial_id().unwrap(), "trial-0001");
    assert_eq!(
        h.engine.get_trial_expiry_date().unwrap(),
        Timestamp::from_secs(common::START + 14 * 86_400)
    );
    assert_eq!(
        h.engine.get_trial_activation_metadata("source").unwrap(),
        "website"
    );

    h.clock.advance_days(13);
    h.engine.is_trial_genuine().unwrap();

    h.clock.advance_days(2);
    assert!(matches!(
        h.engine.is_trial_genuine(),
        Err(LicenseError::TrialExpired)
    ));
}

#[tokio::test]
async fn trial_expires_once_its_timestamp_has_passed() {
    let h = harness();
    h.engine.activate_trial().await.unwrap();
    let expires_at = h.engine.get_trial_expiry_date().unwrap();

    h.clock.set(expires_at.plus_secs(-1));
    h.engine.is_trial_genuine().unwrap();
    h.clock.set(expires_at);
    h.engine.is_trial_genuine().unwrap();

    h.clock.set(expires_at.plus_secs(1));
    assert!(matches!(
        h.engine.is_trial_genuine(),
        Err(LicenseError::TrialExpired)
    ));
}

#[test]
fn trial_check_without_trial_fails() {
    let h = harness();
    assert!(matches!(
        h.engine.is_trial_genuine(),
        Err(LicenseError::TrialNotActivated)
    ));
}

#[tokio::test]
async fn trial_rollback_is_detected() {
    let h = harness();
    h.engine.activate_trial().await.unwrap();
    h.clock.advance_days(5);
    h.engine.is_trial_genuine().unwrap();

    h.clock.advance_days(-3);

    assert!(matches!(
        h.engine.is_trial_genuine(),
        Err(LicenseError::TimeModified)
    ));
}

#[tokio::test]
async fn trial_refused_while_licensed() {
    let h = harness();
    h.engine.activate_license().await.unwrap();

    assert!(matches!(
        h.engine.activate_trial().await,
        Err(LicenseError::AlreadyActivated)
    ));
    assert_eq!(h.backend.calls(Op::Trial), 0);
}

#[tokio::test]
async fn license_activation_replaces_trial() {
    let h = harness();
    h.engine.activate_trial().await.unwrap();

    h.engine.activate_license().await.unwrap();

    assert!(matches!(
        h.engine.is_trial_genuine(),
        Err(LicenseError::TrialNotActivated)
    ));
}

#[tokio::test]
async fn trial_limit_rejection_is_reported() {
    let h = harness();
    h.backend.fail(
        Op::Trial,
        BackendError::Rejected(Rejection::TrialActivationLimitReached),
    );

    assert!(matches!(
        h.engine.activate_trial().await,
        Err(LicenseError::TrialActivationLimit)
    ));
}

#[tokio::test]
async fn trial_for_another_machine_is_refused() {
    let h = harness();
    h.backend
        .update_plan(|p| p.fingerprint_override = Some("another-host".to_string()));

    assert!(matches!(
        h.engine.activate_trial().await,
        Err(LicenseError::MachineFingerprint)
    ));
}

// ── Offline trial ───────────────────────────────────────────────

#[test]
fn offline_trial_round_trip() {
    let h = harness();
    let dir = tempfile::tempdir().unwrap();
    let request = dir.path().join("trial.req");
    let response = dir.path().join("trial.resp");

    h.engine
        .generate_offline_trial_activation_request(&request)
        .unwrap();
    answer_offline_request(&h.backend, &h.clock, &request, &response);
    h.engine.activate_trial_offline(&response).unwrap();

    h.engine.is_trial_genuine().unwrap();
}

#[test]
fn activation_response_cannot_start_trial() {
    let h = harness();
    let dir = tempfile::tempdir().unwrap();
    let trial_req = dir.path().join("trial.req");
    let act_req = dir.path().join("activation.req");
    let act_resp = dir.path().join("activation.resp");

    h.engine
        .generate_offline_trial_activation_request(&trial_req)
        .unwrap();
    h.engine.generate_offline_activation_request(&act_req).unwrap();
    answer_offline_request(&h.backend, &h.clock, &act_req, &act_resp);

    assert!(matches!(
        h.engine.activate_trial_offline(&act_resp),
        Err(LicenseError::OfflineResponseFile(_))
    ));
}
