// src/tests/executor_tests.rs
//! Mutation request tests
//!
//! Requests are validated before anything touches the server; these pin the
//! identifier rules and the priority plumbing. The build protocol itself
//! (advisory lock, concurrent build, verification) needs a server and lives
//! in the integration tests.

use crate::database::IndexValidityRow;
use crate::error::{CreationFailure, CuratorError};
use crate::executor::{MutationPriority, MutationRequest, classify_build_error};

fn request(table: &str, index_name: &str) -> MutationRequest {
    MutationRequest {
        table: table.to_string(),
        field: "email".to_string(),
        index_name: index_name.to_string(),
        index_sql: format!("CREATE INDEX {} ON {} (email)", index_name, table),
        priority: MutationPriority::default(),
    }
}

/// Test that well-formed identifiers pass validation, qualified or not
#[test]
fn test_validation_accepts_clean_identifiers() {
    assert!(request("users", "idx_users_email").validate().is_ok());
    assert!(request("audit.events", "idx_events_actor").validate().is_ok());
    assert!(request("tenant_42.orders", "_private_idx").validate().is_ok());
}

/// Test that injection-shaped identifiers are rejected before reaching
/// the server
#[test]
fn test_validation_rejects_hostile_identifiers() {
    let cases = [
        ("users; DROP TABLE users", "idx_users_email"),
        ("users", "idx; SELECT pg_sleep(10)"),
        ("pub..users", "idx_users_email"),
        ("users", "idx-users-email"),
        ("1users", "idx_users_email"),
        ("", "idx_users_email"),
    ];

    for (table, index_name) in cases {
        let result = request(table, index_name).validate();
        match result {
            Err(CuratorError::IndexCreation { cause, .. }) => {
                assert_eq!(
                    cause,
                    CreationFailure::InvalidDefinition,
                    "'{}' / '{}' must fail as an invalid definition",
                    table,
                    index_name
                );
            }
            Ok(()) => panic!(
                "'{}' / '{}' must not pass identifier validation",
                table, index_name
            ),
            Err(e) => panic!("unexpected error kind: {}", e),
        }
    }
}

/// Test that priority defaults to normal and serializes as snake_case
#[test]
fn test_priority_default_and_serialization() {
    assert_eq!(MutationPriority::default(), MutationPriority::Normal);
    assert_eq!(MutationPriority::High.to_string(), "high");

    assert_eq!(
        serde_json::to_value(MutationPriority::High).unwrap(),
        "high"
    );
    let parsed: MutationPriority = serde_json::from_str("\"low\"").unwrap();
    assert_eq!(parsed, MutationPriority::Low);
}

/// Test that a request deserialized without a priority falls back to normal
#[test]
fn test_request_priority_defaults_on_deserialize() {
    let request: MutationRequest = serde_json::from_str(
        r#"{
            "table": "public.users",
            "field": "email",
            "index_name": "idx_users_email",
            "index_sql": "CREATE INDEX idx_users_email ON public.users (email)"
        }"#,
    )
    .unwrap();

    assert_eq!(request.priority, MutationPriority::Normal);
    assert!(request.validate().is_ok());
}

/// Test that build errors without a recognized SQLSTATE fall back to the
/// generic build failure tag
#[test]
fn test_unrecognized_build_errors_classify_as_build_failure() {
    let err = classify_build_error("idx_users_email", sqlx::Error::PoolTimedOut);
    match err {
        CuratorError::IndexCreation {
            index_name, cause, ..
        } => {
            assert_eq!(index_name, "idx_users_email");
            assert_eq!(cause, CreationFailure::Build);
        }
        other => panic!("expected IndexCreation, got {:?}", other),
    }
}

/// Test that the post-build verification gate only accepts an index with
/// every validity flag set
#[test]
fn test_index_health_requires_all_validity_flags() {
    let healthy = IndexValidityRow {
        index_name: "idx_users_email".to_string(),
        is_valid: true,
        is_ready: true,
        is_live: true,
    };
    assert!(healthy.is_healthy());

    for (is_valid, is_ready, is_live) in
        [(false, true, true), (true, false, true), (true, true, false)]
    {
        let flawed = IndexValidityRow {
            index_name: "idx_users_email".to_string(),
            is_valid,
            is_ready,
            is_live,
        };
        assert!(
            !flawed.is_healthy(),
            "one false flag (valid={}, ready={}, live={}) must fail the gate",
            is_valid,
            is_ready,
            is_live
        );
    }
}

/// Test that transient creation failures advertise a retry window
#[test]
fn test_lock_unavailable_is_transient() {
    let err = CuratorError::IndexCreation {
        index_name: "idx_users_email".to_string(),
        cause: CreationFailure::LockUnavailable,
        detail: "another session is already mutating 'public.users'".to_string(),
    };
    assert!(err.is_transient());
    assert_eq!(err.retry_after_seconds(), Some(30));

    let fatal = CuratorError::IndexCreation {
        index_name: "idx_users_email".to_string(),
        cause: CreationFailure::PermissionDenied,
        detail: "permission denied for table users".to_string(),
    };
    assert!(!fatal.is_transient(), "permission problems need an operator");
}
