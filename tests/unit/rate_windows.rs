//! Sliding-window accounting properties of the rate-limit tracker

use std::sync::Arc;
use workspace_backup::ledger::{RateCategory, RequestLedger};
use workspace_backup::rate_limit::{RateLimitConfig, RateLimitTracker};
use workspace_backup::store::{now_ms, BackupStore, DAY_MS, HOUR_MS};

fn fixtures(config: RateLimitConfig) -> (RateLimitTracker, RequestLedger) {
    let store = Arc::new(BackupStore::open_in_memory().unwrap());
    let ledger = RequestLedger::new(Arc::clone(&store));
    (RateLimitTracker::new(store, config), ledger)
}

#[test]
fn test_window_slides_as_requests_age_out() {
    let (tracker, ledger) = fixtures(RateLimitConfig::default());
    let base = now_ms();
    // Three requests spread over 30 minutes.
    for offset_min in [0, 10, 30] {
        ledger.record_at(
            RateCategory::Standard,
            "GET",
            "/org",
            Some(200),
            None,
            base + offset_min * 60_000,
        );
    }

    let at_40min = tracker
        .status_at(RateCategory::Standard, base + 40 * 60_000)
        .unwrap();
    assert_eq!(at_40min.used, 3);
    assert_eq!(at_40min.reset_at_ms, Some(base + HOUR_MS));

    // Five minutes after the first request leaves the window, the anchor
    // moves to the second one.
    let at_65min = tracker
        .status_at(RateCategory::Standard, base + 65 * 60_000)
        .unwrap();
    assert_eq!(at_65min.used, 2);
    assert_eq!(at_65min.reset_at_ms, Some(base + 10 * 60_000 + HOUR_MS));
}

#[test]
fn test_daily_ceiling_counts_the_full_day() {
    let config = RateLimitConfig {
        hourly_limit: 10,
        daily_limit: 25,
    };
    let (tracker, ledger) = fixtures(config);
    let now = now_ms();
    // Twenty spread across the day, three inside the last hour.
    for i in 0..20i64 {
        let ts = if i < 3 {
            now - 10_000 - i * 1_000
        } else {
            now - HOUR_MS - (i * 60_000)
        };
        ledger.record_at(RateCategory::Standard, "GET", "/a", Some(200), None, ts);
    }

    let status = tracker.status_at(RateCategory::Standard, now).unwrap();
    assert_eq!(status.used, 3);
    assert_eq!(status.remaining, 7);
    assert_eq!(status.daily_used, 20);
    assert_eq!(status.daily_remaining, 5);
}

#[test]
fn test_requests_older_than_a_day_never_count() {
    let (tracker, ledger) = fixtures(RateLimitConfig::default());
    let now = now_ms();
    ledger.record_at(
        RateCategory::Standard,
        "GET",
        "/a",
        Some(200),
        None,
        now - DAY_MS - 60_000,
    );
    ledger.record_at(RateCategory::Standard, "GET", "/b", Some(200), None, now);

    let status = tracker.status_at(RateCategory::Standard, now).unwrap();
    assert_eq!(status.used, 1);
    assert_eq!(status.daily_used, 1);
}

#[test]
fn test_reset_countdown_rounds_up_to_whole_seconds() {
    let (tracker, ledger) = fixtures(RateLimitConfig::default());
    let now = now_ms();
    // Earliest request half a second old: reset in 3599.5s, reported as a
    // ceilinged 3600 rather than a truncated 3599.
    ledger.record_at(
        RateCategory::Standard,
        "GET",
        "/a",
        Some(200),
        None,
        now - HOUR_MS + 3_599_500,
    );
    let status = tracker.status_at(RateCategory::Standard, now).unwrap();
    assert_eq!(status.reset_in_seconds, Some(3_600));
}

#[test]
fn test_tripped_state_supersedes_derived_counts() {
    let config = RateLimitConfig {
        hourly_limit: 1_000,
        daily_limit: 10_000,
    };
    let (tracker, ledger) = fixtures(config);
    let now = now_ms();
    ledger.record_at(RateCategory::Standard, "GET", "/a", Some(200), None, now);

    // The server says 950/950, whatever our ledger thinks.
    assert!(tracker
        .trip_at(RateCategory::Standard, now, 950, 950, now)
        .unwrap());

    let status = tracker.status_at(RateCategory::Standard, now).unwrap();
    assert!(status.tripped);
    assert_eq!(status.used, 950);
    assert_eq!(status.limit, 950);
    assert_eq!(status.remaining, 0);
}
