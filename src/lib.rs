// Curator - Autonomous PostgreSQL Index Lifecycle Engine Library
//!
//! Curator creates, verifies, and retires PostgreSQL indexes on live
//! databases without blocking writers, behind CPU throttling, resource
//! locking, and integrity safeguards.

pub mod audit;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod executor;
pub mod health;
pub mod lifecycle;
pub mod locks;
pub mod metrics;
pub mod progress;
pub mod resilience;
pub mod throttle;
pub mod utils;

#[cfg(test)]
pub mod tests;

// Re-export common types
pub use engine::{BackgroundTasks, CreationOptions, CuratorEngine};
pub use error::{CreationFailure, CuratorError, Result};
pub use executor::{CreationReport, MutationPriority, MutationRequest};
