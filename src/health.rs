// Index Health Classification
//
// Pure scoring over catalog usage rows. The lifecycle orchestrator feeds
// these records into its cleanup and reindex selection; operator tooling
// surfaces them directly.

use serde::Serialize;

use crate::database::IndexUsageRow;

/// Health verdict for one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Scan efficiency has degraded enough to suggest wasted pages.
    Bloated,
    /// Old enough to judge, and almost never scanned.
    Underutilized,
}

/// Assessment of one index, derived entirely from statistics views.
#[derive(Debug, Clone, Serialize)]
pub struct IndexHealthRecord {
    pub schema_name: String,
    pub index_name: String,
    pub table_name: String,
    pub size_bytes: i64,
    pub scan_count: i64,
    /// tuples fetched / tuples read; None before any reads
    pub scan_efficiency: Option<f64>,
    /// Days of statistics observation backing this record
    pub observed_days: Option<f64>,
    pub estimated_bloat_percent: f64,
    pub status: HealthStatus,
}

/// Tunable cutoffs for classification.
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub bloat_threshold_percent: f64,
    pub min_bloat_size_bytes: i64,
    /// Below this many scans per observed day counts as unused
    pub underuse_scans_per_day: f64,
    /// Never judge underuse on fewer observed days than this
    pub min_observed_days: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            bloat_threshold_percent: 30.0,
            min_bloat_size_bytes: 10 * 1024 * 1024,
            underuse_scans_per_day: 1.0,
            min_observed_days: 7.0,
        }
    }
}

/// Estimate bloat from scan efficiency. PostgreSQL keeps no cheap exact
/// bloat figure; `1 - (fetched/read)` over-reads is a usable proxy once the
/// index is big enough for the signal to mean anything.
pub fn estimate_bloat_percent(usage: &IndexUsageRow) -> f64 {
    if usage.tuples_read <= 0 {
        return 0.0;
    }
    let efficiency = usage.tuples_fetched as f64 / usage.tuples_read as f64;
    ((1.0 - efficiency) * 100.0).clamp(0.0, 100.0)
}

/// Classify one index from its usage row and the statistics window length.
pub fn classify_index(
    usage: &IndexUsageRow,
    observed_days: Option<f64>,
    thresholds: &HealthThresholds,
) -> IndexHealthRecord {
    let scan_efficiency = if usage.tuples_read > 0 {
        Some(usage.tuples_fetched as f64 / usage.tuples_read as f64)
    } else {
        None
    };
    let estimated_bloat_percent = estimate_bloat_percent(usage);

    let bloated = usage.size_bytes >= thresholds.min_bloat_size_bytes
        && estimated_bloat_percent >= thresholds.bloat_threshold_percent;

    let underutilized = match observed_days {
        Some(days) if days >= thresholds.min_observed_days => {
            (usage.index_scans as f64 / days) < thresholds.underuse_scans_per_day
        }
        _ => false,
    };

    let status = if bloated {
        HealthStatus::Bloated
    } else if underutilized {
        HealthStatus::Underutilized
    } else {
        HealthStatus::Healthy
    };

    IndexHealthRecord {
        schema_name: usage.schema_name.clone(),
        index_name: usage.index_name.clone(),
        table_name: usage.table_name.clone(),
        size_bytes: usage.size_bytes,
        scan_count: usage.index_scans,
        scan_efficiency,
        observed_days,
        estimated_bloat_percent,
        status,
    }
}

/// Classify a whole schema's usage rows.
pub fn classify_all(
    usage: &[IndexUsageRow],
    observed_days: Option<f64>,
    thresholds: &HealthThresholds,
) -> Vec<IndexHealthRecord> {
    usage
        .iter()
        .map(|row| classify_index(row, observed_days, thresholds))
        .collect()
}
