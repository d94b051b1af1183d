// Typed rows for catalog queries
//
// Every catalog query decodes into one of these instead of a positional
// tuple. Field names match the column aliases in catalog.rs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// Validity flags for a single index, straight from pg_index.
#[derive(Debug, Clone, FromRow)]
pub struct IndexValidityRow {
    pub index_name: String,
    pub is_valid: bool,
    pub is_ready: bool,
    pub is_live: bool,
}

impl IndexValidityRow {
    /// An index is usable only when all three flags hold.
    pub fn is_healthy(&self) -> bool {
        self.is_valid && self.is_ready && self.is_live
    }
}

/// One row from pg_stat_progress_create_index.
#[derive(Debug, Clone, FromRow)]
pub struct BuildProgressRow {
    pub phase: Option<String>,
    pub tuples_done: Option<i64>,
    pub tuples_total: Option<i64>,
}

/// Usage statistics for one index in a tenant schema.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct IndexUsageRow {
    pub schema_name: String,
    pub table_name: String,
    pub index_name: String,
    pub index_scans: i64,
    pub tuples_read: i64,
    pub tuples_fetched: i64,
    pub size_bytes: i64,
    pub is_unique: bool,
    pub is_primary: bool,
    pub supports_constraint: bool,
}

/// An index left invalid by a failed concurrent build.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct InvalidIndexRow {
    pub schema_name: String,
    pub index_name: String,
    pub table_name: String,
}

/// An index entry whose parent table is missing from the catalog.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OrphanedIndexRow {
    pub schema_name: String,
    pub index_name: String,
}

/// An advisory lock with no living session behind it.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StaleAdvisoryLockRow {
    pub key: i64,
    pub pid: i32,
    pub granted: bool,
}

/// A running CREATE INDEX statement seen in pg_stat_activity. Fallback
/// progress source for servers without the progress view.
#[derive(Debug, Clone, FromRow)]
pub struct ActiveStatementRow {
    pub query: String,
    pub running_seconds: Option<f64>,
}

/// A table whose planner statistics have gone stale.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StaleStatisticsRow {
    pub schema_name: String,
    pub table_name: String,
    pub last_analyze: Option<DateTime<Utc>>,
    pub modifications_since_analyze: i64,
}
