// src/tests/lock_tests.rs
//! Resource lock coordinator tests
//!
//! The coordinator never queues: a held (kind, resource) pair fails the next
//! taker immediately. These tests cover fail-fast acquisition, release on
//! every exit path, the stale sweep, and the successor-safety rule that a
//! reclaimed guard must not release a lock it no longer owns.

use std::time::Duration;

use chrono::Utc;

use crate::config::LockConfig;
use crate::error::CuratorError;
use crate::locks::{LockCoordinator, LockKind};
use crate::tests::test_utils::test_metrics;

fn coordinator() -> LockCoordinator {
    let config = LockConfig {
        default_timeout_seconds: 300,
        sweep_interval_seconds: 60,
    };
    LockCoordinator::new(&config, test_metrics())
}

/// Test that a second acquisition of a held resource fails fast with
/// ResourceBusy instead of waiting
#[test]
fn test_second_acquire_fails_fast() {
    let locks = coordinator();

    let _guard = locks
        .acquire(LockKind::IndexCreation, "public.users", None)
        .unwrap();

    let second = locks.acquire(LockKind::IndexCreation, "public.users", None);
    match second {
        Err(CuratorError::ResourceBusy { resource, operation }) => {
            assert_eq!(resource, "public.users");
            assert_eq!(operation, "index_creation");
        }
        other => panic!("expected ResourceBusy, got: {:?}", other.map(|_| ())),
    }
}

/// Test that locks are keyed by (kind, resource): other resources and other
/// kinds stay available
#[test]
fn test_lock_keyed_by_kind_and_resource() {
    let locks = coordinator();

    let _creation = locks
        .acquire(LockKind::IndexCreation, "public.users", None)
        .unwrap();

    assert!(
        locks.acquire(LockKind::IndexCreation, "public.orders", None).is_ok(),
        "a different resource must not contend"
    );
    assert!(
        locks.acquire(LockKind::Reindex, "public.users", None).is_ok(),
        "a different kind on the same resource must not contend"
    );
}

/// Test that dropping the guard releases the lock
#[test]
fn test_guard_drop_releases() {
    let locks = coordinator();

    let guard = locks
        .acquire(LockKind::Maintenance, "maintenance-pass", None)
        .unwrap();
    assert!(locks.is_held(LockKind::Maintenance, "maintenance-pass"));

    drop(guard);
    assert!(
        !locks.is_held(LockKind::Maintenance, "maintenance-pass"),
        "dropping the guard must release the lock"
    );
    assert!(
        locks.acquire(LockKind::Maintenance, "maintenance-pass", None).is_ok(),
        "the resource must be re-acquirable after release"
    );
}

/// Test that explicit release behaves exactly like a drop
#[test]
fn test_explicit_release() {
    let locks = coordinator();

    let guard = locks
        .acquire(LockKind::Integrity, "integrity-sweep", None)
        .unwrap();
    guard.release();

    assert_eq!(locks.held_count(), 0);
}

/// Test that the stale sweep reclaims locks held past twice their timeout
/// and counts them in the safeguard metrics
#[test]
fn test_stale_sweep_reclaims_abandoned_locks() {
    let config = LockConfig {
        default_timeout_seconds: 300,
        sweep_interval_seconds: 60,
    };
    let metrics = test_metrics();
    let locks = LockCoordinator::new(&config, std::sync::Arc::clone(&metrics));

    // Abandoned 700s ago with a 300s timeout: past the 600s reclaim line.
    let now = Utc::now();
    locks.insert_backdated(
        LockKind::IndexCreation,
        "public.users",
        now - chrono::Duration::seconds(700),
        Duration::from_secs(300),
    );
    let _fresh = locks
        .acquire(LockKind::Reindex, "public.orders", None)
        .unwrap();

    let reclaimed = locks.sweep_stale_at(now);
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].resource, "public.users");
    assert!(reclaimed[0].held_seconds >= 700);

    assert!(
        !locks.is_held(LockKind::IndexCreation, "public.users"),
        "the stale lock must be gone"
    );
    assert!(
        locks.is_held(LockKind::Reindex, "public.orders"),
        "fresh locks must survive the sweep"
    );
    assert_eq!(metrics.snapshot().stale_locks_reclaimed, 1);

    // Nothing left to reclaim: the sweep is idempotent.
    let second = locks.sweep_stale_at(now);
    assert!(second.is_empty(), "a second sweep must find nothing");
    assert_eq!(metrics.snapshot().stale_locks_reclaimed, 1);
}

/// Test that locks inside twice their timeout are left alone
#[test]
fn test_sweep_leaves_recent_locks() {
    let locks = coordinator();

    // 400s held with a 300s timeout is late but under the 600s reclaim line.
    let now = Utc::now();
    locks.insert_backdated(
        LockKind::IndexCreation,
        "public.users",
        now - chrono::Duration::seconds(400),
        Duration::from_secs(300),
    );

    let reclaimed = locks.sweep_stale_at(now);
    assert!(reclaimed.is_empty(), "400s < 2x300s must not be reclaimed");
    assert!(locks.is_held(LockKind::IndexCreation, "public.users"));
}

/// Test that a guard whose lock was reclaimed never releases the
/// successor's lock
#[test]
fn test_reclaimed_guard_never_clobbers_successor() {
    let locks = coordinator();

    let old_guard = locks
        .acquire(LockKind::IndexCreation, "public.users", None)
        .unwrap();

    // Simulate the operation wedging long enough for the sweep to reclaim.
    let future = Utc::now() + chrono::Duration::seconds(700);
    let reclaimed = locks.sweep_stale_at(future);
    assert_eq!(reclaimed.len(), 1, "the wedged lock must be reclaimed");

    // A successor takes over the resource.
    let successor = locks
        .acquire(LockKind::IndexCreation, "public.users", None)
        .unwrap();

    // The zombie guard finally drops; the successor's lock must survive.
    drop(old_guard);
    assert!(
        locks.is_held(LockKind::IndexCreation, "public.users"),
        "dropping a reclaimed guard must leave the successor's lock in place"
    );

    drop(successor);
    assert!(!locks.is_held(LockKind::IndexCreation, "public.users"));
}

/// Test that the active lock view reports the oldest lock first
#[test]
fn test_active_locks_oldest_first() {
    let locks = coordinator();

    let now = Utc::now();
    locks.insert_backdated(
        LockKind::Maintenance,
        "maintenance-pass",
        now - chrono::Duration::seconds(50),
        Duration::from_secs(300),
    );
    let _fresh = locks
        .acquire(LockKind::IndexCreation, "public.users", None)
        .unwrap();

    let active = locks.active_locks();
    assert_eq!(active.len(), 2);
    assert_eq!(active[0].resource, "maintenance-pass");
    assert!(active[0].held_seconds >= active[1].held_seconds);
    assert_eq!(active[0].timeout_seconds, 300);
}
