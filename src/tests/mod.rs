// Curator's Test Infrastructure
//
// This module contains test utilities and the unit/integration suites for the
// throttle governor, lock coordinator, safe-operation scopes, build tracking,
// lifecycle maintenance, and configuration handling.
//
// Tests that need a live PostgreSQL server are gated on the
// CURATOR_TEST_DATABASE_URL environment variable and skip (with a note) when
// it is unset, so `cargo test` passes on a bare checkout.

// ============================================================================
// TEST UTILITIES - Fake CPU probe, config builders, offline database handles
// ============================================================================
pub mod test_utils;

pub mod lock_tests; // Fail-fast acquisition, guard release, stale sweep
pub mod resilience_tests; // Operation registry exclusivity and stuck detection

// ============================================================================
// TRACKING AND LIFECYCLE TESTS - Build registry, maintenance selection
// ============================================================================
pub mod progress_tests; // Build tracking, hang detection, progress views
pub mod lifecycle_tests; // Cleanup candidate selection and report plumbing

pub mod executor_tests; // Mutation request validation and priority handling

// ============================================================================
// INTEGRATION TESTS - Live PostgreSQL (CURATOR_TEST_DATABASE_URL)
// ============================================================================
pub mod database_integration_tests; // Catalog reads, advisory locks, full builds
