// Lifecycle orchestrator
//
// Weekly cadence: drop unused indexes, rebuild bloated ones, refresh stale
// planner statistics. Monthly cadence: VACUUM ANALYZE the tables that gained
// or rebuilt indexes since the last pass. Cadence stamps live in memory; a
// restart just means the next due check fires sooner.
//
// Every step is fault-isolated. One failing table or index logs, lands in
// the report's error list, and the pass moves on.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::Connection;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::config::{LifecycleConfig, ThrottleConfig};
use crate::database::{Database, IndexUsageRow, catalog};
use crate::error::{CuratorError, Result};
use crate::health::{self, HealthStatus, HealthThresholds, IndexHealthRecord};
use crate::locks::{LockCoordinator, LockKind};
use crate::resilience::SafeOperations;
use crate::throttle::ThrottleGovernor;

/// An index the cleanup step dropped (or would drop, in dry-run).
#[derive(Debug, Clone, Serialize)]
pub struct RemovedIndex {
    pub schema_name: String,
    pub index_name: String,
    pub table_name: String,
    pub size_bytes: i64,
    pub index_scans: i64,
    /// False in dry-run mode
    pub removed: bool,
}

/// How a rebuild was performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReindexMode {
    Concurrent,
    Blocking,
    DryRun,
}

/// An index the reindex step rebuilt (or flagged, in dry-run).
#[derive(Debug, Clone, Serialize)]
pub struct ReindexedIndex {
    pub schema_name: String,
    pub index_name: String,
    pub table_name: String,
    pub size_bytes: i64,
    pub estimated_bloat_percent: f64,
    pub mode: ReindexMode,
}

/// A table whose planner statistics were refreshed.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzedTable {
    pub schema_name: String,
    pub table_name: String,
    pub last_analyze: Option<DateTime<Utc>>,
    pub modifications_since_analyze: i64,
}

/// A step failure that did not stop the pass.
#[derive(Debug, Clone, Serialize)]
pub struct StepError {
    pub step: String,
    pub detail: String,
}

/// Everything one maintenance pass did.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cadences_run: Vec<String>,
    pub removed_indexes: Vec<RemovedIndex>,
    pub reindexed_indexes: Vec<ReindexedIndex>,
    pub analyzed_tables: Vec<AnalyzedTable>,
    pub vacuumed_tables: Vec<String>,
    pub errors: Vec<StepError>,
}

impl MaintenanceReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            cadences_run: Vec::new(),
            removed_indexes: Vec::new(),
            reindexed_indexes: Vec::new(),
            analyzed_tables: Vec::new(),
            vacuumed_tables: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn did_anything(&self) -> bool {
        !self.cadences_run.is_empty()
    }
}

/// Scheduler view for operator tooling.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleStatus {
    pub enabled: bool,
    pub last_weekly_run: Option<DateTime<Utc>>,
    pub last_monthly_run: Option<DateTime<Utc>>,
    pub next_weekly_run: Option<DateTime<Utc>>,
    pub next_monthly_run: Option<DateTime<Utc>>,
    pub pending_vacuum_tables: usize,
}

#[derive(Default)]
struct CadenceState {
    last_weekly: Option<DateTime<Utc>>,
    last_monthly: Option<DateTime<Utc>>,
}

pub struct LifecycleOrchestrator {
    db: Arc<Database>,
    safe_ops: Arc<SafeOperations>,
    locks: Arc<LockCoordinator>,
    throttle: Arc<ThrottleGovernor>,
    audit: Option<Arc<dyn AuditSink>>,
    config: LifecycleConfig,
    max_cooldown_wait: std::time::Duration,
    state: Mutex<CadenceState>,
    /// Tables that gained or rebuilt an index since the last vacuum pass
    pending_vacuum: Mutex<BTreeSet<(String, String)>>,
}

impl LifecycleOrchestrator {
    pub fn new(
        db: Arc<Database>,
        safe_ops: Arc<SafeOperations>,
        locks: Arc<LockCoordinator>,
        throttle: Arc<ThrottleGovernor>,
        audit: Option<Arc<dyn AuditSink>>,
        config: LifecycleConfig,
        throttle_config: &ThrottleConfig,
    ) -> Self {
        Self {
            db,
            safe_ops,
            locks,
            throttle,
            audit,
            config,
            max_cooldown_wait: throttle_config.max_cooldown_wait(),
            state: Mutex::new(CadenceState::default()),
            pending_vacuum: Mutex::new(BTreeSet::new()),
        }
    }

    /// Remember that a table gained an index; the monthly vacuum targets it.
    pub fn note_table_indexed(&self, schema: &str, table: &str) {
        self.pending_vacuum
            .lock()
            .unwrap()
            .insert((schema.to_string(), table.to_string()));
    }

    pub fn status(&self) -> LifecycleStatus {
        let state = self.state.lock().unwrap();
        let weekly = Duration::days(self.config.weekly_interval_days);
        let monthly = Duration::days(self.config.monthly_interval_days);
        LifecycleStatus {
            enabled: self.config.enabled,
            last_weekly_run: state.last_weekly,
            last_monthly_run: state.last_monthly,
            next_weekly_run: state.last_weekly.map(|t| t + weekly),
            next_monthly_run: state.last_monthly.map(|t| t + monthly),
            pending_vacuum_tables: self.pending_vacuum.lock().unwrap().len(),
        }
    }

    fn weekly_due(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock().unwrap();
        match state.last_weekly {
            Some(last) => now - last >= Duration::days(self.config.weekly_interval_days),
            None => true,
        }
    }

    fn monthly_due(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock().unwrap();
        match state.last_monthly {
            Some(last) => now - last >= Duration::days(self.config.monthly_interval_days),
            None => true,
        }
    }

    /// Run every due cadence. `force` runs both regardless of schedule.
    /// Concurrent passes are rejected with ResourceBusy, never queued.
    pub async fn run_maintenance_pass(&self, force: bool) -> Result<MaintenanceReport> {
        let _guard = self
            .locks
            .acquire(LockKind::Maintenance, "maintenance-pass", None)?;

        let now = Utc::now();
        let weekly = force || self.weekly_due(now);
        let monthly = force || self.monthly_due(now);
        let mut report = MaintenanceReport::new();

        if !self.config.enabled && !force {
            debug!("Lifecycle maintenance disabled; skipping pass");
            report.finished_at = Utc::now();
            return Ok(report);
        }
        if !weekly && !monthly {
            debug!("No maintenance cadence due");
            report.finished_at = Utc::now();
            return Ok(report);
        }

        info!(
            "🔁 Maintenance pass starting (weekly: {}, monthly: {})",
            weekly, monthly
        );

        if weekly {
            report.cadences_run.push("weekly".to_string());

            if self.config.cleanup.enabled {
                self.cooldown_gate("cleanup").await;
                match self
                    .cleanup_unused_indexes(
                        self.config.cleanup.min_scans,
                        self.config.cleanup.days_unused,
                        self.config.cleanup.dry_run,
                    )
                    .await
                {
                    Ok(removed) => report.removed_indexes = removed,
                    Err(e) => report.errors.push(StepError {
                        step: "cleanup".to_string(),
                        detail: e.to_string(),
                    }),
                }
            }

            if self.config.reindex.enabled {
                self.cooldown_gate("reindex").await;
                match self
                    .reindex_bloated(
                        self.config.reindex.bloat_threshold_percent,
                        self.config.reindex.min_size_mb,
                        self.config.reindex.dry_run,
                    )
                    .await
                {
                    Ok(rebuilt) => report.reindexed_indexes = rebuilt,
                    Err(e) => report.errors.push(StepError {
                        step: "reindex".to_string(),
                        detail: e.to_string(),
                    }),
                }
            }

            if self.config.statistics.enabled {
                match self.refresh_statistics().await {
                    Ok(analyzed) => report.analyzed_tables = analyzed,
                    Err(e) => report.errors.push(StepError {
                        step: "statistics".to_string(),
                        detail: e.to_string(),
                    }),
                }
            }

            self.state.lock().unwrap().last_weekly = Some(Utc::now());
        }

        if monthly {
            report.cadences_run.push("monthly".to_string());

            if self.config.vacuum.enabled {
                self.cooldown_gate("vacuum").await;
                match self.vacuum_recently_indexed().await {
                    Ok(vacuumed) => report.vacuumed_tables = vacuumed,
                    Err(e) => report.errors.push(StepError {
                        step: "vacuum".to_string(),
                        detail: e.to_string(),
                    }),
                }
            }

            self.state.lock().unwrap().last_monthly = Some(Utc::now());
        }

        report.finished_at = Utc::now();
        info!(
            "Maintenance pass done: {} removed, {} reindexed, {} analyzed, {} vacuumed, {} errors",
            report.removed_indexes.len(),
            report.reindexed_indexes.len(),
            report.analyzed_tables.len(),
            report.vacuumed_tables.len(),
            report.errors.len()
        );
        self.emit(AuditEvent::MaintenanceCompleted {
            cadences: report.cadences_run.clone(),
            errors: report.errors.len(),
        })
        .await;

        Ok(report)
    }

    /// Background steps wait for CPU to settle instead of failing fast. A
    /// timed-out wait proceeds anyway; the pass must not starve forever on a
    /// busy host.
    async fn cooldown_gate(&self, step: &str) {
        let outcome = self.throttle.wait_for_cooldown(self.max_cooldown_wait).await;
        if !outcome.is_cooled() {
            warn!("Starting {} step despite sustained CPU pressure", step);
        }
    }

    /// Drop indexes with almost no lifetime scans. Unique, primary-key, and
    /// constraint-backing indexes are never candidates; low scan counts on
    /// those mean enforcement, not waste.
    pub async fn cleanup_unused_indexes(
        &self,
        min_scans: i64,
        days_unused: i64,
        dry_run: bool,
    ) -> Result<Vec<RemovedIndex>> {
        let observed_days = catalog::statistics_window_days(self.db.pool()).await?;
        let mut removed = Vec::new();

        for tenant in &self.config.tenants {
            let usage = catalog::index_usage(self.db.pool(), tenant).await?;
            let candidates = select_cleanup_candidates(
                &usage,
                min_scans,
                days_unused,
                observed_days,
                self.config.cleanup.managed_prefix.as_deref(),
            );

            for candidate in candidates {
                if dry_run {
                    info!(
                        "🧪 [dry-run] Would drop unused index '{}.{}' ({} scans, {} bytes)",
                        candidate.schema_name,
                        candidate.index_name,
                        candidate.index_scans,
                        candidate.size_bytes
                    );
                    removed.push(removal_record(candidate, false));
                    continue;
                }

                match self.drop_one_index(candidate).await {
                    Ok(true) => {
                        self.throttle.mark_mutation_complete();
                        self.emit(AuditEvent::IndexRemoved {
                            index_name: candidate.index_name.clone(),
                            table_name: candidate.table_name.clone(),
                            size_bytes: candidate.size_bytes,
                            dry_run: false,
                        })
                        .await;
                        removed.push(removal_record(candidate, true));
                    }
                    Ok(false) => {}
                    Err(CuratorError::Disabled) => return Err(CuratorError::Disabled),
                    Err(e) => {
                        warn!(
                            "Could not drop unused index '{}.{}': {}",
                            candidate.schema_name, candidate.index_name, e
                        );
                    }
                }
            }
        }

        Ok(removed)
    }

    /// Drop one index inside a safe scope. The catalog is re-checked through
    /// the scope's transaction; the statistics that selected the candidate
    /// may be minutes old. Returns false when the index was already gone.
    async fn drop_one_index(&self, candidate: &IndexUsageRow) -> Result<bool> {
        let schema = candidate.schema_name.clone();
        let index = candidate.index_name.clone();
        let resource = format!("{}.{}", candidate.schema_name, candidate.table_name);
        let conn = self.db.dedicated_connection().await?;

        self.safe_ops
            .run("index-cleanup", &resource, move |tx| {
                Box::pin(async move {
                    let mut conn = conn;
                    if !catalog::index_exists(&mut **tx, &schema, &index).await? {
                        debug!("Index '{}.{}' already gone", schema, index);
                        conn.close().await.ok();
                        return Ok(false);
                    }
                    let dropped = catalog::drop_index(&mut conn, &schema, &index, true).await;
                    conn.close().await.ok();
                    dropped.map(|_| {
                        info!("🗑️ Dropped unused index '{}.{}'", schema, index);
                        true
                    })
                })
            })
            .await
    }

    /// Rebuild indexes whose bloat estimate crossed the threshold.
    pub async fn reindex_bloated(
        &self,
        bloat_threshold_percent: f64,
        min_size_mb: i64,
        dry_run: bool,
    ) -> Result<Vec<ReindexedIndex>> {
        let observed_days = catalog::statistics_window_days(self.db.pool()).await?;
        let concurrent_supported = match catalog::server_version_num(self.db.pool()).await {
            Ok(version) => version >= 120_000,
            Err(e) => {
                warn!("Could not determine server version: {}; assuming no concurrent REINDEX", e);
                false
            }
        };

        let thresholds = HealthThresholds {
            bloat_threshold_percent,
            min_bloat_size_bytes: min_size_mb * 1024 * 1024,
            ..HealthThresholds::default()
        };

        let mut rebuilt = Vec::new();
        for tenant in &self.config.tenants {
            let usage = catalog::index_usage(self.db.pool(), tenant).await?;
            let records = health::classify_all(&usage, observed_days, &thresholds);

            for record in records
                .iter()
                .filter(|r| r.status == HealthStatus::Bloated)
            {
                if dry_run {
                    info!(
                        "🧪 [dry-run] Would rebuild bloated index '{}.{}' (~{:.0}% bloat, {} bytes)",
                        record.schema_name,
                        record.index_name,
                        record.estimated_bloat_percent,
                        record.size_bytes
                    );
                    rebuilt.push(reindex_record(record, ReindexMode::DryRun));
                    continue;
                }

                match self.reindex_one(record, concurrent_supported).await {
                    Ok(Some(mode)) => {
                        self.throttle.mark_mutation_complete();
                        self.note_table_indexed(&record.schema_name, &record.table_name);
                        self.emit(AuditEvent::Reindexed {
                            index_name: record.index_name.clone(),
                            table_name: record.table_name.clone(),
                            blocking: mode == ReindexMode::Blocking,
                        })
                        .await;
                        rebuilt.push(reindex_record(record, mode));
                    }
                    Ok(None) => {}
                    Err(CuratorError::Disabled) => return Err(CuratorError::Disabled),
                    Err(e) => {
                        warn!(
                            "Could not rebuild index '{}.{}': {}",
                            record.schema_name, record.index_name, e
                        );
                    }
                }
            }
        }

        Ok(rebuilt)
    }

    /// Rebuild one index inside a safe scope. Prefers REINDEX CONCURRENTLY;
    /// the blocking form runs only when the config switch allows it, and is
    /// logged loudly because it takes exclusive table locks. None means the
    /// index vanished before the rebuild started.
    async fn reindex_one(
        &self,
        record: &IndexHealthRecord,
        concurrent_supported: bool,
    ) -> Result<Option<ReindexMode>> {
        let schema = record.schema_name.clone();
        let index = record.index_name.clone();
        let resource = format!("{}.{}", record.schema_name, record.table_name);
        let allow_blocking = self.config.reindex.allow_blocking_fallback;
        let conn = self.db.dedicated_connection().await?;

        let mode = self
            .safe_ops
            .run("reindex", &resource, move |tx| {
                Box::pin(async move {
                    let mut conn = conn;
                    if !catalog::index_exists(&mut **tx, &schema, &index).await? {
                        debug!("Index '{}.{}' vanished before rebuild", schema, index);
                        conn.close().await.ok();
                        return Ok(None);
                    }

                    let concurrent_result = if concurrent_supported {
                        catalog::reindex_concurrently(&mut conn, &schema, &index).await
                    } else {
                        Err(CuratorError::Integrity(
                            "server does not support REINDEX CONCURRENTLY".to_string(),
                        ))
                    };

                    let outcome = match concurrent_result {
                        Ok(()) => {
                            info!("♻️ Rebuilt index '{}.{}' concurrently", schema, index);
                            Ok(Some(ReindexMode::Concurrent))
                        }
                        Err(concurrent_err) if allow_blocking => {
                            warn!(
                                "🚧 BLOCKING REINDEX of '{}.{}': concurrent rebuild unavailable ({})",
                                schema, index, concurrent_err
                            );
                            catalog::reindex_blocking(&mut conn, &schema, &index)
                                .await
                                .map(|_| Some(ReindexMode::Blocking))
                        }
                        Err(concurrent_err) => Err(concurrent_err),
                    };

                    conn.close().await.ok();
                    outcome
                })
            })
            .await?;

        if mode == Some(ReindexMode::Blocking) {
            self.emit(AuditEvent::BlockingReindexFallback {
                index_name: record.index_name.clone(),
                table_name: record.table_name.clone(),
                reason: "concurrent rebuild unavailable".to_string(),
            })
            .await;
        }
        Ok(mode)
    }

    /// ANALYZE tables whose planner statistics have gone stale.
    pub async fn refresh_statistics(&self) -> Result<Vec<AnalyzedTable>> {
        let mut analyzed = Vec::new();
        for tenant in &self.config.tenants {
            let stale = catalog::tables_with_stale_statistics(
                self.db.pool(),
                tenant,
                self.config.statistics.staleness_days,
            )
            .await?;

            for row in stale {
                match catalog::analyze_table(self.db.pool(), &row.schema_name, &row.table_name)
                    .await
                {
                    Ok(()) => {
                        debug!("📐 Analyzed '{}.{}'", row.schema_name, row.table_name);
                        analyzed.push(AnalyzedTable {
                            schema_name: row.schema_name,
                            table_name: row.table_name,
                            last_analyze: row.last_analyze,
                            modifications_since_analyze: row.modifications_since_analyze,
                        });
                    }
                    Err(e) => warn!(
                        "ANALYZE of '{}.{}' failed: {}",
                        row.schema_name, row.table_name, e
                    ),
                }
            }
        }
        Ok(analyzed)
    }

    /// VACUUM ANALYZE tables that gained indexes since the last pass. Tables
    /// that fail stay queued for the next pass.
    pub async fn vacuum_recently_indexed(&self) -> Result<Vec<String>> {
        let batch: Vec<(String, String)> = {
            let mut pending = self.pending_vacuum.lock().unwrap();
            let batch: Vec<(String, String)> = pending
                .iter()
                .take(self.config.vacuum.max_tables_per_pass)
                .cloned()
                .collect();
            for key in &batch {
                pending.remove(key);
            }
            batch
        };

        if batch.is_empty() {
            debug!("No recently indexed tables awaiting vacuum");
            return Ok(Vec::new());
        }

        let mut vacuumed = Vec::new();
        for (schema, table) in batch {
            let mut conn = self.db.dedicated_connection().await?;
            let outcome = catalog::vacuum_analyze(&mut conn, &schema, &table).await;
            conn.close().await.ok();
            match outcome {
                Ok(()) => {
                    info!("🧹 VACUUM ANALYZE '{}.{}'", schema, table);
                    vacuumed.push(format!("{}.{}", schema, table));
                }
                Err(e) => {
                    warn!("VACUUM of '{}.{}' failed, requeued: {}", schema, table, e);
                    self.pending_vacuum
                        .lock()
                        .unwrap()
                        .insert((schema, table));
                }
            }
        }
        Ok(vacuumed)
    }

    async fn emit(&self, event: AuditEvent) {
        if let Some(sink) = &self.audit {
            sink.record(event).await;
        }
    }
}

fn removal_record(candidate: &IndexUsageRow, removed: bool) -> RemovedIndex {
    RemovedIndex {
        schema_name: candidate.schema_name.clone(),
        index_name: candidate.index_name.clone(),
        table_name: candidate.table_name.clone(),
        size_bytes: candidate.size_bytes,
        index_scans: candidate.index_scans,
        removed,
    }
}

fn reindex_record(record: &IndexHealthRecord, mode: ReindexMode) -> ReindexedIndex {
    ReindexedIndex {
        schema_name: record.schema_name.clone(),
        index_name: record.index_name.clone(),
        table_name: record.table_name.clone(),
        size_bytes: record.size_bytes,
        estimated_bloat_percent: record.estimated_bloat_percent,
        mode,
    }
}

/// Pick indexes safe to drop: never unique, primary, or constraint-backing;
/// only when the statistics window is old enough to judge; only below the
/// scan floor; and only inside the managed prefix when one is set.
pub fn select_cleanup_candidates<'a>(
    usage: &'a [IndexUsageRow],
    min_scans: i64,
    days_unused: i64,
    observed_days: Option<f64>,
    managed_prefix: Option<&str>,
) -> Vec<&'a IndexUsageRow> {
    let Some(days) = observed_days else {
        debug!("Statistics window unknown; skipping cleanup selection");
        return Vec::new();
    };
    if days < days_unused as f64 {
        debug!(
            "Statistics window only {:.1} days (< {} required); skipping cleanup selection",
            days, days_unused
        );
        return Vec::new();
    }

    usage
        .iter()
        .filter(|row| !row.is_unique && !row.is_primary && !row.supports_constraint)
        .filter(|row| row.index_scans < min_scans)
        .filter(|row| match managed_prefix {
            Some(prefix) => row.index_name.starts_with(prefix),
            None => true,
        })
        .collect()
}
