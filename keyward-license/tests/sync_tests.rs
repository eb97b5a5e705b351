mod common;

use common::{Harness, Op, harness, wait_for_calls};
use keyward_license::backend::{BackendError, Rejection};
use keyward_license::{ActivationState, LicenseError, StatusCode};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::sync::mpsc;

const HOUR: i64 = 3_600;
const DAY: i64 = 86_400;

/// Activates a license that syncs hourly with a three-day grace period.
async fn synced_harness() -> Harness {
    common::init_tracing();
    let h = harness();
    h.backend.update_plan(|p| {
        p.sync_interval_secs = HOUR;
        p.grace_period_secs = 3 * DAY;
    });
    h.engine.activate_license().await.unwrap();
    h
}

// ── Sync outcomes ───────────────────────────────────────────────

#[tokio::test]
async fn successful_sync_reports_ok() {
    let h = synced_harness().await;
    h.clock.advance_secs(HOUR);

    assert_eq!(h.engine.sync_now().await, Some(StatusCode::Ok));
    assert_eq!(h.backend.calls(Op::Sync), 1);
    h.engine.is_license_valid().unwrap();
}

#[tokio::test]
async fn sync_sends_local_meter_ledger() {
    let h = synced_harness().await;
    h.engine
        .increment_activation_meter_attribute_uses("exports", 2)
        .await
        .unwrap();

    h.engine.sync_now().await;

    let sent = h.backend.syncs();
    assert_eq!(sent[0].meter_attributes[0].name, "exports");
    assert_eq!(sent[0].meter_attributes[0].total_uses, 2);
    assert_eq!(h.engine.get_activation_meter_attribute_uses("exports").unwrap(), 2);
}

#[tokio::test]
async fn outage_within_grace_keeps_license_valid() {
    let h = synced_harness().await;
    h.backend
        .fail(Op::Sync, BackendError::Network("no route".to_string()));
    h.clock.advance_secs(2 * DAY);

    assert_eq!(h.engine.sync_now().await, Some(StatusCode::NetworkError));
    h.engine.is_license_valid().unwrap();
}

#[tokio::test]
async fn outage_past_grace_turns_into_grace_period_over() {
    let h = synced_harness().await;
    h.backend
        .fail(Op::Sync, BackendError::Network("no route".to_string()));
    h.clock.advance_secs(3 * DAY + 1);

    assert_eq!(h.engine.sync_now().await, Some(StatusCode::GracePeriodOver));
    assert!(matches!(
        h.engine.is_license_valid(),
        Err(LicenseError::GracePeriodOver)
    ));
    assert_eq!(h.engine.activation_state(), ActivationState::GracePeriodOver);
}

#[tokio::test]
async fn recovery_after_grace_restores_license() {
    let h = synced_harness().await;
    h.backend
        .fail(Op::Sync, BackendError::Server("503".to_string()));
    h.clock.advance_secs(4 * DAY);
    assert_eq!(h.engine.sync_now().await, Some(StatusCode::GracePeriodOver));

    h.backend.recover(Op::Sync);

    assert_eq!(h.engine.sync_now().await, Some(StatusCode::Ok));
    h.engine.is_license_valid().unwrap();
}

#[tokio::test]
async fn grace_expiry_date_follows_last_success() {
    let h = synced_harness().await;
    let before = h
        .engine
        .get_server_sync_grace_period_expiry_date()
        .unwrap()
        .unwrap();

    h.clock.advance_secs(DAY);
    h.engine.sync_now().await;

    let after = h
        .engine
        .get_server_sync_grace_period_expiry_date()
        .unwrap()
        .unwrap();
    assert_eq!(after.secs_since(before), DAY);
}

#[tokio::test]
async fn revocation_is_terminal() {
    let h = synced_harness().await;
    h.backend
        .fail(Op::Sync, BackendError::Rejected(Rejection::Revoked));

    assert_eq!(h.engine.sync_now().await, Some(StatusCode::Revoked));
    assert!(matches!(
        h.engine.is_license_valid(),
        Err(LicenseError::Revoked)
    ));
    assert_eq!(h.engine.activation_state(), ActivationState::Revoked);

    h.backend.recover(Op::Sync);
    assert_eq!(h.engine.sync_now().await, None);
    assert_eq!(h.backend.calls(Op::Sync), 1);
}

#[tokio::test]
async fn suspension_is_terminal() {
    let h = synced_harness().await;
    h.backend
        .fail(Op::Sync, BackendError::Rejected(Rejection::Suspended));

    assert_eq!(h.engine.sync_now().await, Some(StatusCode::Suspended));
    assert_eq!(h.engine.activation_state(), ActivationState::Suspended);
}

#[tokio::test]
async fn rate_limiting_is_not_terminal() {
    let h = synced_harness().await;
    h.backend.fail(Op::Sync, BackendError::RateLimited);

    assert_eq!(h.engine.sync_now().await, Some(StatusCode::RateLimited));
    h.engine.is_license_valid().unwrap();
}

#[tokio::test]
async fn restrictions_hold_until_next_successful_sync() {
    let cases = [
        (Rejection::AuthenticationFailed, StatusCode::AuthenticationFailed),
        (Rejection::CountryRestricted, StatusCode::CountryRestricted),
        (Rejection::IpRestricted, StatusCode::IpRestricted),
    ];
    for (rejection, expected) in cases {
        let h = synced_harness().await;
        h.backend.fail(Op::Sync, BackendError::Rejected(rejection));

        assert_eq!(h.engine.sync_now().await, Some(expected));
        let err = h.engine.is_license_valid().unwrap_err();
        assert_eq!(StatusCode::from(&err), expected);
        assert_eq!(h.engine.activation_state(), ActivationState::Restricted);

        h.backend.recover(Op::Sync);
        assert_eq!(h.engine.sync_now().await, Some(StatusCode::Ok));
        h.engine.is_license_valid().unwrap();
    }
}

#[tokio::test]
async fn token_for_another_machine_on_sync_is_terminal() {
    let h = synced_harness().await;
    h.backend
        .update_plan(|p| p.fingerprint_override = Some("cloned-vm".to_string()));

    assert_eq!(
        h.engine.sync_now().await,
        Some(StatusCode::MachineFingerprintChanged)
    );
    assert!(matches!(
        h.engine.is_license_valid(),
        Err(LicenseError::MachineFingerprint)
    ));
}

#[tokio::test]
async fn clock_rollback_during_sync_is_reported() {
    let h = synced_harness().await;
    h.clock.advance_secs(DAY);
    h.engine.is_license_valid().unwrap();
    h.clock.advance_secs(-HOUR);

    assert_eq!(h.engine.sync_now().await, Some(StatusCode::TimeModified));
}

#[tokio::test]
async fn offline_activation_is_never_synced() {
    let h = harness();
    h.backend.update_plan(|p| p.sync_interval_secs = HOUR);
    let dir = tempfile::tempdir().unwrap();
    let request = dir.path().join("activation.req");
    let response = dir.path().join("activation.resp");
    h.engine.generate_offline_activation_request(&request).unwrap();
    common::answer_offline_request(&h.backend, &h.clock, &request, &response);
    h.engine.activate_license_offline(&response).unwrap();

    assert_eq!(h.engine.sync_now().await, None);
    assert_eq!(h.backend.calls(Op::Sync), 0);
}

// ── Callback delivery ───────────────────────────────────────────

#[tokio::test]
async fn callback_receives_sync_status() {
    let h = synced_harness().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    h.engine.set_license_callback(move |status| {
        let _ = tx.send(status);
    });
    h.backend.fail(Op::Sync, BackendError::Rejected(Rejection::Expired));

    h.engine.sync_now().await;

    let status = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap();
    assert_eq!(status, Some(StatusCode::Expired));
}

#[tokio::test]
async fn genuine_check_triggers_background_sync() {
    let h = synced_harness().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    h.engine.set_license_callback(move |status| {
        let _ = tx.send(status);
    });

    h.engine.is_license_genuine().unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap();
    assert_eq!(status, Some(StatusCode::Ok));
    assert_eq!(h.backend.calls(Op::Sync), 1);
}

#[tokio::test]
async fn genuine_check_without_sync_interval_stays_local() {
    let h = harness();
    h.engine.activate_license().await.unwrap();

    h.engine.is_license_genuine().unwrap();
    tokio::task::yield_now().await;

    assert_eq!(h.backend.calls(Op::Sync), 0);
}

#[tokio::test]
async fn shutdown_stops_background_sync() {
    let h = synced_harness().await;
    h.engine.shutdown();

    h.engine.is_license_genuine().unwrap();
    tokio::task::yield_now().await;

    assert_eq!(h.backend.calls(Op::Sync), 0);
}

#[tokio::test(start_paused = true)]
async fn background_loop_lapses_grace_without_any_call() {
    let h = synced_harness().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    h.engine.set_license_callback(move |status| {
        let _ = tx.send(status);
    });
    h.backend
        .fail(Op::Sync, BackendError::Network("no route".to_string()));
    h.clock.advance_secs(3 * DAY + 1);

    let status = tokio::time::timeout(Duration::from_secs(2 * HOUR as u64), rx.recv())
        .await
        .unwrap();

    assert_eq!(status, Some(StatusCode::GracePeriodOver));
    assert_eq!(h.backend.calls(Op::Sync), 1);
    assert!(matches!(
        h.engine.is_license_valid(),
        Err(LicenseError::GracePeriodOver)
    ));
}

// ── Coalescing ──────────────────────────────────────────────────

#[tokio::test]
async fn overlapping_sync_requests_are_coalesced() {
    let h = synced_harness().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    h.engine.set_license_callback(move |status| {
        let _ = tx.send(status);
    });
    let gate = h.backend.hold(Op::Sync);

    h.engine.is_license_genuine().unwrap();
    wait_for_calls(&h.backend, Op::Sync, 1).await;
    h.engine.is_license_genuine().unwrap();
    assert_eq!(h.engine.sync_now().await, None);

    gate.notify_one();
    let status = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap();

    assert_eq!(status, Some(StatusCode::Ok));
    assert_eq!(h.backend.calls(Op::Sync), 1);
}

#[tokio::test]
async fn sync_result_for_a_removed_activation_is_dropped() {
    let h = synced_harness().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    h.engine.set_license_callback(move |status| {
        let _ = tx.send(status);
    });
    let gate = h.backend.hold(Op::Sync);
    let engine = h.engine.clone();
    let pending = tokio::spawn(async move { engine.sync_now().await });

    wait_for_calls(&h.backend, Op::Sync, 1).await;
    h.engine.deactivate_license().await.unwrap();
    gate.notify_one();

    assert_eq!(pending.await.unwrap(), None);
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err()
    );
}
