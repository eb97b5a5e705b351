mod common;

use common::{MockBackend, file_engine, harness};
use keyward_license::{LicenseError, LocalTrialState, Timestamp};
use keyward_types::ManualClock;
use pretty_assertions::assert_eq;
use std::sync::Arc;

// ── State ───────────────────────────────────────────────────────

#[test]
fn expiry_is_sticky_even_if_clock_returns() {
    let start = Timestamp::from_secs(common::START);
    let mut trial = LocalTrialState::start(start, 7);

    assert!(matches!(
        trial.check(start.plus_days(8), 0),
        Err(LicenseError::LocalTrialExpired)
    ));
    assert!(trial.expired);

    assert!(matches!(
        trial.check(start.plus_days(1), i64::MAX / 4),
        Err(LicenseError::LocalTrialExpired)
    ));
}

#[test]
fn extension_moves_expiry_not_watermark() {
    let start = Timestamp::from_secs(common::START);
    let mut trial = LocalTrialState::start(start, 7);
    trial.check(start.plus_days(2), 0).unwrap();

    trial.extend(5, start.plus_days(2), 0).unwrap();

    assert_eq!(trial.expires_at(), start.plus_days(12));
    assert_eq!(trial.watermark, start.plus_days(2));
}

#[test]
fn extension_after_expiry_is_refused() {
    let start = Timestamp::from_secs(common::START);
    let mut trial = LocalTrialState::start(start, 1);

    assert!(matches!(
        trial.extend(30, start.plus_days(3), 0),
        Err(LicenseError::LocalTrialExpired)
    ));
    assert_eq!(trial.length_days, 1);
}

// ── Engine ──────────────────────────────────────────────────────

#[test]
fn local_trial_runs_its_course() {
    let h = harness();
    h.engine.activate_local_trial(7).unwrap();
    assert_eq!(
        h.engine.get_local_trial_expiry_date().unwrap(),
        Timestamp::from_secs(common::START).plus_days(7)
    );

    h.clock.advance_days(6);
    h.engine.is_local_trial_genuine().unwrap();

    h.clock.advance_days(2);
    assert!(matches!(
        h.engine.is_local_trial_genuine(),
        Err(LicenseError::LocalTrialExpired)
    ));
}

#[test]
fn local_trial_expires_once_its_end_has_passed() {
    let h = harness();
    h.engine.activate_local_trial(3).unwrap();
    let end = h.engine.get_local_trial_expiry_date().unwrap();

    h.clock.set(end.plus_secs(-1));
    h.engine.is_local_trial_genuine().unwrap();
    h.clock.set(end);
    h.engine.is_local_trial_genuine().unwrap();

    h.clock.set(end.plus_secs(1));
    assert!(matches!(
        h.engine.is_local_trial_genuine(),
        Err(LicenseError::LocalTrialExpired)
    ));
}

#[test]
fn local_trial_rollback_of_one_second_is_detected() {
    let h = harness();
    h.engine.activate_local_trial(5).unwrap();
    h.clock.advance_secs(1_000);
    h.engine.is_local_trial_genuine().unwrap();

    h.clock.advance_secs(-1);

    assert!(matches!(
        h.engine.is_local_trial_genuine(),
        Err(LicenseError::TimeModified)
    ));
}

#[test]
fn local_trial_rollback_is_detected() {
    let h = harness();
    h.engine.activate_local_trial(30).unwrap();
    h.clock.advance_days(4);
    h.engine.is_local_trial_genuine().unwrap();

    h.clock.advance_days(-2);

    assert!(matches!(
        h.engine.is_local_trial_genuine(),
        Err(LicenseError::TimeModified)
    ));
}

#[test]
fn reactivating_does_not_restart_the_window() {
    let h = harness();
    h.engine.activate_local_trial(3).unwrap();
    h.clock.advance_days(4);

    assert!(matches!(
        h.engine.activate_local_trial(3),
        Err(LicenseError::LocalTrialExpired)
    ));
    assert_eq!(
        h.engine.get_local_trial_expiry_date().unwrap(),
        Timestamp::from_secs(common::START).plus_days(3)
    );
}

#[test]
fn extension_through_engine() {
    let h = harness();
    h.engine.activate_local_trial(3).unwrap();
    h.engine.extend_local_trial(4).unwrap();

    h.clock.advance_days(6);
    h.engine.is_local_trial_genuine().unwrap();
}

#[test]
fn local_trial_without_start_fails() {
    let h = harness();
    assert!(matches!(
        h.engine.is_local_trial_genuine(),
        Err(LicenseError::TrialNotActivated)
    ));
    assert!(matches!(
        h.engine.extend_local_trial(3),
        Err(LicenseError::TrialNotActivated)
    ));
}

#[test]
fn reset_keeps_local_trial() {
    let h = harness();
    h.engine.activate_local_trial(10).unwrap();

    h.engine.reset().unwrap();

    h.engine.is_local_trial_genuine().unwrap();
}

#[test]
fn local_trial_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(Timestamp::from_secs(common::START)));
    let backend = Arc::new(MockBackend::new(clock.clone()));

    {
        let engine = file_engine(dir.path(), &clock, &backend);
        engine.activate_local_trial(5).unwrap();
        clock.advance_days(2);
        engine.is_local_trial_genuine().unwrap();
    }

    clock.advance_days(-1);
    let engine = file_engine(dir.path(), &clock, &backend);
    assert!(matches!(
        engine.is_local_trial_genuine(),
        Err(LicenseError::TimeModified)
    ));
}

#[test]
fn expired_local_trial_stays_expired_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(Timestamp::from_secs(common::START)));
    let backend = Arc::new(MockBackend::new(clock.clone()));

    {
        let engine = file_engine(dir.path(), &clock, &backend);
        engine.activate_local_trial(2).unwrap();
        clock.advance_days(3);
        assert!(engine.is_local_trial_genuine().is_err());
    }

    clock.set(Timestamp::from_secs(common::START));
    let engine = file_engine(dir.path(), &clock, &backend);
    assert!(matches!(
        engine.is_local_trial_genuine(),
        Err(LicenseError::LocalTrialExpired)
    ));
}
