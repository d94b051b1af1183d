// src/tests/lifecycle_tests.rs
//! Lifecycle maintenance tests
//!
//! Cleanup candidate selection is pure, so every safety rule gets pinned
//! here: constraint-backing indexes are untouchable, a short statistics
//! window disqualifies everything, the scan floor and managed prefix bound
//! what can be dropped. The orchestrator's database steps run under the
//! integration tests.

use crate::lifecycle::{
    MaintenanceReport, ReindexMode, RemovedIndex, StepError, select_cleanup_candidates,
};
use crate::tests::test_utils::usage_row;

/// Test that unique, primary, and constraint-backing indexes are never
/// selected no matter how unused they are
#[test]
fn test_constraint_indexes_never_selected() {
    let mut unique = usage_row("public", "users", "users_email_key", 0);
    unique.is_unique = true;
    let mut primary = usage_row("public", "users", "users_pkey", 0);
    primary.is_primary = true;
    primary.is_unique = true;
    let mut constraint = usage_row("public", "users", "users_tenant_fkey", 0);
    constraint.supports_constraint = true;
    let plain = usage_row("public", "users", "idx_users_last_login", 0);

    let usage = vec![unique, primary, constraint, plain];
    let selected = select_cleanup_candidates(&usage, 10, 7, Some(30.0), None);

    assert_eq!(selected.len(), 1, "only the plain index is droppable");
    assert_eq!(selected[0].index_name, "idx_users_last_login");
}

/// Test that an unknown or too-short statistics window disqualifies
/// every candidate
#[test]
fn test_short_statistics_window_selects_nothing() {
    let usage = vec![usage_row("public", "users", "idx_users_last_login", 0)];

    assert!(
        select_cleanup_candidates(&usage, 10, 7, None, None).is_empty(),
        "an unknown window means zero scans proves nothing"
    );
    assert!(
        select_cleanup_candidates(&usage, 10, 7, Some(3.0), None).is_empty(),
        "3 observed days cannot justify a 7-day-unused claim"
    );
    assert_eq!(
        select_cleanup_candidates(&usage, 10, 7, Some(7.0), None).len(),
        1,
        "a window exactly at the requirement qualifies"
    );
}

/// Test that the scan floor separates candidates from survivors
#[test]
fn test_scan_floor_bounds_selection() {
    let cold = usage_row("public", "users", "idx_users_cold", 3);
    let warm = usage_row("public", "users", "idx_users_warm", 50);

    let usage = vec![cold, warm];
    let selected = select_cleanup_candidates(&usage, 10, 7, Some(30.0), None);

    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].index_name, "idx_users_cold");
}

/// Test that a managed prefix restricts drops to indexes this engine named
#[test]
fn test_managed_prefix_limits_selection() {
    let ours = usage_row("public", "users", "curator_users_email", 0);
    let theirs = usage_row("public", "users", "idx_handmade", 0);

    let usage = vec![ours, theirs];
    let selected = select_cleanup_candidates(&usage, 10, 7, Some(30.0), Some("curator_"));

    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].index_name, "curator_users_email");
}

/// Test that the maintenance report only claims work when a cadence ran
#[test]
fn test_maintenance_report_did_anything() {
    let now = chrono::Utc::now();
    let mut report = MaintenanceReport {
        started_at: now,
        finished_at: now,
        cadences_run: Vec::new(),
        removed_indexes: Vec::new(),
        reindexed_indexes: Vec::new(),
        analyzed_tables: Vec::new(),
        vacuumed_tables: Vec::new(),
        errors: Vec::new(),
    };
    assert!(!report.did_anything(), "no cadence ran, nothing happened");

    report.cadences_run.push("weekly".to_string());
    report.removed_indexes.push(RemovedIndex {
        schema_name: "public".to_string(),
        index_name: "idx_users_cold".to_string(),
        table_name: "users".to_string(),
        size_bytes: 1024,
        index_scans: 0,
        removed: true,
    });
    report.errors.push(StepError {
        step: "reindex".to_string(),
        detail: "connection reset".to_string(),
    });
    assert!(report.did_anything());
}

/// Test that reindex modes serialize as snake_case for the audit stream
#[test]
fn test_reindex_mode_serialization() {
    assert_eq!(
        serde_json::to_value(ReindexMode::Concurrent).unwrap(),
        "concurrent"
    );
    assert_eq!(serde_json::to_value(ReindexMode::Blocking).unwrap(), "blocking");
    assert_eq!(serde_json::to_value(ReindexMode::DryRun).unwrap(), "dry_run");
}
