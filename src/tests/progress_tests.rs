// src/tests/progress_tests.rs
//! Build tracker tests
//!
//! The tracker's registry operations (track, complete, fail, hang detection,
//! the active-build view) never touch the server, so these run against an
//! offline database handle. Progress queries against the live catalog are
//! covered by the integration tests.

use chrono::{Duration, Utc};

use crate::config::BuildConfig;
use crate::progress::{BuildProgress, BuildStatus, BuildTracker};
use crate::tests::test_utils::offline_database;

fn tracker() -> BuildTracker {
    let config = BuildConfig {
        hang_threshold_seconds: 3600,
        poll_interval_seconds: 30,
        statement_timeout_seconds: 3600,
    };
    BuildTracker::new(offline_database(), &config)
}

// The offline handle still builds a lazy sqlx pool, which wants a runtime,
// so these are tokio tests even though nothing awaits.

/// Test that tracking registers a build and completion removes it
#[tokio::test]
async fn test_track_and_complete() {
    let tracker = tracker();

    tracker.track("idx_users_email", "public.users");
    assert_eq!(tracker.tracked_count(), 1);

    tracker.complete("idx_users_email");
    assert_eq!(tracker.tracked_count(), 0);
}

/// Test that a failed build is removed from tracking
#[tokio::test]
async fn test_fail_removes_build() {
    let tracker = tracker();

    tracker.track("idx_users_email", "public.users");
    tracker.fail("idx_users_email");
    assert_eq!(tracker.tracked_count(), 0);

    // Removing an unknown build is a no-op, not a panic.
    tracker.fail("idx_never_tracked");
}

/// Test that a build past the hang threshold is flagged but stays tracked
#[tokio::test]
async fn test_hang_detection_flags_old_builds() {
    let tracker = tracker();
    let now = Utc::now();

    tracker.track("idx_users_email", "public.users");
    tracker.backdate("idx_users_email", now - Duration::hours(2));

    let hanging = tracker.check_hanging_at(now);
    assert_eq!(hanging.len(), 1);
    assert_eq!(hanging[0].index_name, "idx_users_email");
    assert_eq!(hanging[0].status, BuildStatus::Hanging);
    assert_eq!(
        tracker.tracked_count(),
        1,
        "hang detection is advisory; the build stays tracked"
    );
}

/// Test that fresh builds are not flagged as hanging
#[tokio::test]
async fn test_fresh_builds_not_hanging() {
    let tracker = tracker();

    tracker.track("idx_users_email", "public.users");
    let hanging = tracker.check_hanging_at(Utc::now());
    assert!(hanging.is_empty(), "a just-started build must not be flagged");

    let active = tracker.active_builds();
    assert_eq!(active[0].status, BuildStatus::Building);
}

/// Test that the active view orders builds longest-running first and leaves
/// progress empty until the server reports it
#[tokio::test]
async fn test_active_builds_longest_running_first() {
    let tracker = tracker();
    let now = Utc::now();

    tracker.track("idx_new", "public.orders");
    tracker.track("idx_old", "public.users");
    tracker.backdate("idx_old", now - Duration::minutes(30));

    let active = tracker.active_builds();
    assert_eq!(active.len(), 2);
    assert_eq!(active[0].index_name, "idx_old");
    assert!(active[0].running_seconds >= active[1].running_seconds);
    assert_eq!(
        active[0].progress_percent, None,
        "no progress rows have been polled yet"
    );
    assert_eq!(active[0].phase, None);
}

/// Test that progress answers serialize with a state tag for the ops CLI
#[test]
fn test_progress_serialization_shape() {
    let in_progress = BuildProgress::InProgress {
        phase: "building index".to_string(),
        tuples_done: 500,
        tuples_total: 1000,
    };
    let value = serde_json::to_value(&in_progress).unwrap();
    assert_eq!(value["state"], "in_progress");
    assert_eq!(value["tuples_done"], 500);

    let complete = serde_json::to_value(&BuildProgress::Complete).unwrap();
    assert_eq!(complete["state"], "complete");

    let unknown = serde_json::to_value(&BuildProgress::Unknown).unwrap();
    assert_eq!(unknown["state"], "unknown");
}
