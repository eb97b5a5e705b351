use keyward_types::{Clock, ManualClock, SystemClock, Timestamp, SECS_PER_DAY};
use proptest::prelude::*;

// ── Timestamp ────────────────────────────────────────────────────

#[test]
fn timestamp_arithmetic() {
    let t = Timestamp::from_secs(1_000);
    assert_eq!(t.plus_secs(500).as_secs(), 1_500);
    assert_eq!(t.plus_days(2).as_secs(), 1_000 + 2 * SECS_PER_DAY);
    assert_eq!(t.plus_secs(500).secs_since(t), 500);
    assert_eq!(t.secs_since(t.plus_secs(500)), -500);
}

#[test]
fn timestamp_saturates() {
    let t = Timestamp::from_secs(i64::MAX - 1);
    assert_eq!(t.plus_secs(10).as_secs(), i64::MAX);
}

#[test]
fn timestamp_ordering() {
    assert!(Timestamp::from_secs(1) < Timestamp::from_secs(2));
    assert_eq!(Timestamp::default(), Timestamp::EPOCH);
}

#[test]
fn timestamp_rfc3339() {
    assert_eq!(Timestamp::EPOCH.to_rfc3339(), "1970-01-01T00:00:00+00:00");
    assert_eq!(format!("{}", Timestamp::EPOCH), "1970-01-01T00:00:00+00:00");
}

#[test]
fn timestamp_serde_is_transparent() {
    let json = serde_json::to_string(&Timestamp::from_secs(42)).unwrap();
    assert_eq!(json, "42");
    let parsed: Timestamp = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.as_secs(), 42);
}

// ── Clocks ───────────────────────────────────────────────────────

#[test]
fn system_clock_is_after_2020() {
    assert!(SystemClock.now().as_secs() > 1_577_836_800);
}

#[test]
fn manual_clock_moves_only_when_told() {
    let clock = ManualClock::new(Timestamp::from_secs(100));
    assert_eq!(clock.now().as_secs(), 100);
    clock.advance_secs(50);
    assert_eq!(clock.now().as_secs(), 150);
    clock.advance_days(1);
    assert_eq!(clock.now().as_secs(), 150 + SECS_PER_DAY);
    clock.set(Timestamp::from_secs(10));
    assert_eq!(clock.now().as_secs(), 10);
}

#[test]
fn manual_clock_can_rewind() {
    let clock = ManualClock::new(Timestamp::from_secs(1_000));
    clock.advance_secs(-600);
    assert_eq!(clock.now().as_secs(), 400);
}

proptest! {
    #[test]
    fn plus_days_matches_plus_secs(start in 0i64..4_000_000_000, days in 0u32..10_000) {
        let t = Timestamp::from_secs(start);
        prop_assert_eq!(t.plus_days(days), t.plus_secs(i64::from(days) * SECS_PER_DAY));
        prop_assert!(t.plus_days(days) >= t);
    }
}
