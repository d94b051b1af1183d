// src/tests/resilience_tests.rs
//! Operation registry tests
//!
//! The registry is the in-process half of safe scopes: exclusive
//! registration per resource, deregistration on drop, and stuck-operation
//! detection for the integrity sweep. Everything here runs in memory; the
//! transactional half of SafeOperations is covered by the live-server
//! integration tests.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};

use std::collections::HashSet;

use crate::config::{BuildConfig, IntegrityConfig, OperationConfig};
use crate::database::InvalidIndexRow;
use crate::error::CuratorError;
use crate::progress::BuildTracker;
use crate::resilience::{IntegrityReport, OperationRegistry, SafeOperations, split_issue_novelty};
use crate::tests::test_utils::{offline_database, test_metrics};

/// Test that a resource can only be claimed by one operation at a time
#[test]
fn test_registry_exclusive_per_resource() {
    let registry = OperationRegistry::new();

    let _ticket = registry.begin("create-index", "public.users").unwrap();

    match registry.begin("drop-index", "public.users") {
        Err(CuratorError::ResourceBusy { resource, operation }) => {
            assert_eq!(resource, "public.users");
            assert_eq!(operation, "create-index", "the holder's name should be reported");
        }
        other => panic!("expected ResourceBusy, got: {:?}", other.map(|_| ())),
    }

    assert!(
        registry.begin("create-index", "public.orders").is_ok(),
        "a different resource must not contend"
    );
}

/// Test that dropping the ticket deregisters the operation
#[test]
fn test_ticket_drop_deregisters() {
    let registry = OperationRegistry::new();

    let ticket = registry.begin("create-index", "public.users").unwrap();
    assert_eq!(registry.active_count(), 1);

    drop(ticket);
    assert_eq!(registry.active_count(), 0);
    assert!(
        registry.begin("create-index", "public.users").is_ok(),
        "the resource must be claimable again after the ticket drops"
    );
}

/// Test that N tasks racing for the same resource produce exactly one winner
#[tokio::test]
async fn test_concurrent_claims_have_single_winner() -> Result<()> {
    let registry = Arc::new(OperationRegistry::new());

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            registry.begin("create-index", "public.users")
        }));
    }

    let mut winners = 0;
    let mut busy = 0;
    let mut tickets = Vec::new();
    for task in tasks {
        match task.await? {
            Ok(ticket) => {
                winners += 1;
                // Hold the ticket so later claims in this loop still contend.
                tickets.push(ticket);
            }
            Err(CuratorError::ResourceBusy { .. }) => busy += 1,
            Err(e) => panic!("unexpected error from begin: {}", e),
        }
    }

    assert_eq!(winners, 1, "exactly one task must claim the resource");
    assert_eq!(busy, 15, "every loser must see ResourceBusy");
    assert_eq!(registry.active_count(), 1);
    Ok(())
}

/// Test that operations registered past the age limit are flagged as stuck
/// without being removed
#[test]
fn test_stuck_detection_is_read_only() {
    let registry = OperationRegistry::new();
    let now = Utc::now();

    let _ticket = registry
        .begin_backdated("create-index", "public.users", now - Duration::hours(2))
        .unwrap();

    let stuck = registry.stuck_at(now, Duration::hours(1));
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].resource, "public.users");
    assert_eq!(
        registry.active_count(),
        1,
        "detection must not deregister the operation"
    );
}

/// Test that clearing stuck operations removes only the old ones
#[test]
fn test_clear_stuck_leaves_fresh_operations() {
    let registry = OperationRegistry::new();
    let now = Utc::now();

    let _old = registry
        .begin_backdated("create-index", "public.users", now - Duration::hours(2))
        .unwrap();
    let _fresh = registry.begin("reindex", "public.orders").unwrap();

    let cleared = registry.clear_stuck_at(now, Duration::hours(1));
    assert_eq!(cleared.len(), 1);
    assert_eq!(cleared[0].resource, "public.users");

    assert_eq!(registry.active_count(), 1, "the fresh operation must survive");
    assert_eq!(registry.active()[0].resource, "public.orders");
}

/// Test that the kill switch fails safe scopes before any work starts
#[tokio::test]
async fn test_kill_switch_blocks_safe_scopes() -> Result<()> {
    let db = offline_database();
    let tracker = Arc::new(BuildTracker::new(Arc::clone(&db), &BuildConfig::default()));
    let safe_ops = SafeOperations::new(
        db,
        tracker,
        test_metrics(),
        None,
        &OperationConfig::default(),
        &IntegrityConfig::default(),
    );

    assert!(safe_ops.is_enabled(), "scopes start enabled");
    safe_ops.set_enabled(false);

    // The gate fires before registration or any transaction, so an offline
    // database handle is enough here.
    let result: crate::error::Result<()> = safe_ops
        .run("create-index", "public.users", |_tx| {
            Box::pin(async move { Ok(()) })
        })
        .await;
    assert!(
        matches!(result, Err(CuratorError::Disabled)),
        "a disabled engine must refuse every scope"
    );
    assert_eq!(safe_ops.active_operations().len(), 0);

    safe_ops.set_enabled(true);
    assert!(safe_ops.is_enabled());
    Ok(())
}

fn keys(raw: &[&str]) -> HashSet<String> {
    raw.iter().map(|k| k.to_string()).collect()
}

/// Test that sweep bookkeeping only demotes issues to known, never hides
/// them: repeats stop alerting but a resolved-then-relapsed issue alerts
/// again
#[test]
fn test_issue_novelty_tracks_repeats_and_relapses() {
    let mut known = HashSet::new();

    let first = split_issue_novelty(&mut known, keys(&["invalid:public.idx_a", "orphaned:public.idx_b"]));
    assert_eq!(first, (2, 0), "a first sweep sees everything as new");

    let second = split_issue_novelty(&mut known, keys(&["invalid:public.idx_a", "orphaned:public.idx_b"]));
    assert_eq!(second, (0, 2), "an unchanged second sweep alerts on nothing");

    let third = split_issue_novelty(&mut known, keys(&["invalid:public.idx_a"]));
    assert_eq!(third, (0, 1), "a resolved issue drops out of the count");

    let relapse = split_issue_novelty(&mut known, keys(&["invalid:public.idx_a", "orphaned:public.idx_b"]));
    assert_eq!(relapse, (1, 1), "an issue that comes back must alert again");
}

/// Test that a report holding only previously-known issues still demands
/// remediation; a failed fix must be retried on the next sweep, not silenced
#[test]
fn test_known_issues_still_demand_remediation() {
    let report = IntegrityReport {
        checked_at: Utc::now(),
        invalid_indexes: vec![InvalidIndexRow {
            schema_name: "public".to_string(),
            index_name: "idx_users_email".to_string(),
            table_name: "users".to_string(),
        }],
        orphaned_indexes: Vec::new(),
        stale_advisory_locks: Vec::new(),
        stuck_operations: Vec::new(),
        newly_observed: 0,
        previously_known: 1,
    };

    assert!(!report.is_clean(), "a repeat finding is still an open issue");
    assert_eq!(report.issue_count(), 1);
}

/// Test that the active view is ordered by start time, oldest first
#[test]
fn test_active_operations_oldest_first() {
    let registry = OperationRegistry::new();
    let now = Utc::now();

    let _b = registry
        .begin_backdated("reindex", "public.orders", now - Duration::minutes(5))
        .unwrap();
    let _a = registry
        .begin_backdated("create-index", "public.users", now - Duration::minutes(30))
        .unwrap();

    let active = registry.active();
    assert_eq!(active.len(), 2);
    assert_eq!(active[0].resource, "public.users");
    assert_eq!(active[1].resource, "public.orders");
}
