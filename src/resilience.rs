// Safe operation scope and integrity sweeps
//
// Every mutating operation runs through SafeOperations::run: a kill-switch
// gate, registration in the active-operations registry, an explicit
// READ COMMITTED transaction, commit on success, rollback on failure. A
// rollback that itself fails escalates to a critical error; that state means
// the database connection is in an unknown condition.
//
// The integrity sweep looks for damage left behind by crashed builds and
// dead sessions. Every sweep reports everything currently present, so a
// remediation that failed once is retried on the next pass; issues already
// seen by an earlier sweep are tracked separately to keep alerts quiet.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use sqlx::{Connection, Postgres, Transaction};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::config::{IntegrityConfig, OperationConfig};
use crate::database::{Database, catalog};
use crate::error::{CuratorError, Result};
use crate::metrics::SafeguardMetrics;
use crate::progress::BuildTracker;

/// A mutating operation currently inside a safe scope.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveOperation {
    pub operation_id: Uuid,
    pub name: String,
    pub resource: String,
    pub started_at: DateTime<Utc>,
}

type OperationMap = Arc<Mutex<HashMap<String, ActiveOperation>>>;

/// In-memory registry of active operations, keyed by resource. Registration
/// is exclusive per resource; a second operation against the same resource
/// is rejected, never queued.
#[derive(Default)]
pub struct OperationRegistry {
    operations: OperationMap,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation, failing with ResourceBusy when the resource is
    /// already claimed.
    pub fn begin(&self, name: &str, resource: &str) -> Result<OperationTicket> {
        let mut operations = self.operations.lock().unwrap();
        if let Some(existing) = operations.get(resource) {
            return Err(CuratorError::ResourceBusy {
                resource: resource.to_string(),
                operation: existing.name.clone(),
            });
        }
        let operation = ActiveOperation {
            operation_id: Uuid::new_v4(),
            name: name.to_string(),
            resource: resource.to_string(),
            started_at: Utc::now(),
        };
        let operation_id = operation.operation_id;
        operations.insert(resource.to_string(), operation);
        debug!("Registered operation '{}' on '{}'", name, resource);

        Ok(OperationTicket {
            operations: Arc::clone(&self.operations),
            resource: Some(resource.to_string()),
            operation_id,
        })
    }

    pub fn active(&self) -> Vec<ActiveOperation> {
        let operations = self.operations.lock().unwrap();
        let mut active: Vec<ActiveOperation> = operations.values().cloned().collect();
        active.sort_by_key(|op| op.started_at);
        active
    }

    pub fn active_count(&self) -> usize {
        self.operations.lock().unwrap().len()
    }

    /// Operations registered longer than `max_age`, without removing them.
    pub(crate) fn stuck_at(&self, now: DateTime<Utc>, max_age: Duration) -> Vec<ActiveOperation> {
        let operations = self.operations.lock().unwrap();
        operations
            .values()
            .filter(|op| now - op.started_at > max_age)
            .cloned()
            .collect()
    }

    /// Drop registrations older than `max_age`. The underlying task may still
    /// be running; clearing the registration only unblocks the resource.
    pub(crate) fn clear_stuck_at(
        &self,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Vec<ActiveOperation> {
        let mut operations = self.operations.lock().unwrap();
        let mut cleared = Vec::new();
        operations.retain(|_, op| {
            if now - op.started_at > max_age {
                warn!(
                    "Clearing stuck operation '{}' on '{}' registered {}s ago",
                    op.name,
                    op.resource,
                    (now - op.started_at).num_seconds()
                );
                cleared.push(op.clone());
                false
            } else {
                true
            }
        });
        cleared
    }

    /// Register with a back-dated start. Test scaffolding for stuck-op
    /// detection.
    #[cfg(test)]
    pub(crate) fn begin_backdated(
        &self,
        name: &str,
        resource: &str,
        started_at: DateTime<Utc>,
    ) -> Result<OperationTicket> {
        let ticket = self.begin(name, resource)?;
        let mut operations = self.operations.lock().unwrap();
        if let Some(op) = operations.get_mut(resource) {
            op.started_at = started_at;
        }
        Ok(ticket)
    }
}

/// RAII registration handle. Dropping deregisters, so the registry never
/// leaks an entry on panic or early return. Deregistration is keyed by
/// operation id; an entry cleared as stuck and re-claimed by a successor is
/// left alone.
pub struct OperationTicket {
    operations: OperationMap,
    resource: Option<String>,
    operation_id: Uuid,
}

impl OperationTicket {
    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }
}

impl Drop for OperationTicket {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        let mut operations = self.operations.lock().unwrap();
        match operations.get(&resource) {
            Some(current) if current.operation_id == self.operation_id => {
                operations.remove(&resource);
            }
            _ => {}
        }
    }
}

/// Everything one integrity sweep found, whether first seen now or still
/// present from an earlier sweep.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub checked_at: DateTime<Utc>,
    pub invalid_indexes: Vec<crate::database::InvalidIndexRow>,
    pub orphaned_indexes: Vec<crate::database::OrphanedIndexRow>,
    pub stale_advisory_locks: Vec<crate::database::StaleAdvisoryLockRow>,
    pub stuck_operations: Vec<ActiveOperation>,
    /// Issues the previous sweep had not seen
    pub newly_observed: usize,
    /// Issues seen on an earlier sweep and still present
    pub previously_known: usize,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.issue_count() == 0
    }

    pub fn issue_count(&self) -> usize {
        self.invalid_indexes.len()
            + self.orphaned_indexes.len()
            + self.stale_advisory_locks.len()
            + self.stuck_operations.len()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} invalid, {} orphaned, {} stale advisory locks, {} stuck operations",
            self.invalid_indexes.len(),
            self.orphaned_indexes.len(),
            self.stale_advisory_locks.len(),
            self.stuck_operations.len()
        )
    }
}

/// Replace `known` with `current` and report how the sweep's findings split:
/// `(newly_observed, previously_known)`. An issue stays "known" only while it
/// keeps showing up; once absent it is forgotten, so a relapse alerts again.
pub(crate) fn split_issue_novelty(
    known: &mut HashSet<String>,
    current: HashSet<String>,
) -> (usize, usize) {
    let newly_observed = current.difference(known).count();
    let previously_known = current.len() - newly_observed;
    *known = current;
    (newly_observed, previously_known)
}

/// What remediation actually did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrityRemediation {
    pub invalid_dropped: usize,
    pub invalid_skipped_in_build: usize,
    pub orphans_dropped: usize,
    pub own_session_locks_released: bool,
    pub operations_cleared: usize,
}

pub struct SafeOperations {
    db: Arc<Database>,
    registry: OperationRegistry,
    tracker: Arc<BuildTracker>,
    metrics: Arc<SafeguardMetrics>,
    audit: Option<Arc<dyn AuditSink>>,
    enabled: AtomicBool,
    max_operation_age: Duration,
    remediate_by_default: bool,
    known_issues: Mutex<HashSet<String>>,
}

impl SafeOperations {
    pub fn new(
        db: Arc<Database>,
        tracker: Arc<BuildTracker>,
        metrics: Arc<SafeguardMetrics>,
        audit: Option<Arc<dyn AuditSink>>,
        operations: &OperationConfig,
        integrity: &IntegrityConfig,
    ) -> Self {
        Self {
            db,
            registry: OperationRegistry::new(),
            tracker,
            metrics,
            audit,
            enabled: AtomicBool::new(true),
            max_operation_age: Duration::seconds(operations.max_duration_seconds as i64),
            remediate_by_default: integrity.remediate,
            known_issues: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Kill switch. While disabled every safe scope fails fast with Disabled.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if enabled {
            info!("Mutating operations enabled");
        } else {
            warn!("🛑 Mutating operations disabled");
        }
    }

    pub fn active_operations(&self) -> Vec<ActiveOperation> {
        self.registry.active()
    }

    /// Run a mutating operation inside a safe scope: kill-switch gate,
    /// exclusive registration on `resource`, explicit READ COMMITTED
    /// transaction, commit on success, rollback on failure.
    ///
    /// A failed rollback escalates to `RollbackFailure` and a critical log
    /// line; the original error rides along in the detail.
    pub async fn run<T, F>(&self, name: &str, resource: &str, operation: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut Transaction<'static, Postgres>) -> BoxFuture<'c, Result<T>>
            + Send,
    {
        if !self.is_enabled() {
            return Err(CuratorError::Disabled);
        }

        let _ticket = self.registry.begin(name, resource)?;

        let mut tx = self.db.pool().begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await?;

        match operation(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                debug!("Operation '{}' on '{}' committed", name, resource);
                Ok(value)
            }
            Err(original) => {
                if let Err(rollback_err) = tx.rollback().await {
                    self.metrics.record_rollback_failure();
                    error!(
                        "🚨 CRITICAL: rollback failed for '{}' on '{}': {} (original error: {})",
                        name, resource, rollback_err, original
                    );
                    self.emit(AuditEvent::RollbackFailure {
                        operation: name.to_string(),
                        resource: resource.to_string(),
                        detail: rollback_err.to_string(),
                    })
                    .await;
                    return Err(CuratorError::RollbackFailure {
                        operation: name.to_string(),
                        detail: format!("{} (original error: {})", rollback_err, original),
                    });
                }
                warn!(
                    "↩️ Rolled back '{}' on '{}' after error: {}",
                    name, resource, original
                );
                Err(original)
            }
        }
    }

    async fn emit(&self, event: AuditEvent) {
        if let Some(sink) = &self.audit {
            sink.record(event).await;
        }
    }

    /// Sweep the catalog and registries for integrity damage. The report
    /// carries every issue currently present so remediation never skips a
    /// repeat finding; `newly_observed` / `previously_known` split them by
    /// whether the previous sweep already saw them, and only new ones raise
    /// alerts.
    pub async fn check_database_integrity(&self) -> Result<IntegrityReport> {
        let pool = self.db.pool();
        let invalid = catalog::invalid_indexes(pool).await?;
        let orphaned = catalog::orphaned_indexes(pool).await?;
        let stale_locks = catalog::stale_advisory_locks(pool).await?;
        let stuck = self
            .registry
            .stuck_at(Utc::now(), self.max_operation_age);

        let mut current_keys = HashSet::new();
        for row in &invalid {
            current_keys.insert(format!("invalid:{}.{}", row.schema_name, row.index_name));
        }
        for row in &orphaned {
            current_keys.insert(format!("orphaned:{}.{}", row.schema_name, row.index_name));
        }
        for row in &stale_locks {
            current_keys.insert(format!("advisory:{}", row.key));
        }
        for op in &stuck {
            current_keys.insert(format!("stuck:{}", op.operation_id));
        }

        let (newly_observed, previously_known) = {
            let mut known_issues = self.known_issues.lock().unwrap();
            split_issue_novelty(&mut known_issues, current_keys)
        };

        let report = IntegrityReport {
            checked_at: Utc::now(),
            invalid_indexes: invalid,
            orphaned_indexes: orphaned,
            stale_advisory_locks: stale_locks,
            stuck_operations: stuck,
            newly_observed,
            previously_known,
        };

        if report.newly_observed > 0 {
            warn!(
                "⚠️ Integrity sweep found {} new issues ({} still open from earlier sweeps): {}",
                report.newly_observed, report.previously_known, report.summary()
            );
            self.metrics
                .record_integrity_issues(report.newly_observed as u64);
            self.emit(AuditEvent::IntegrityIssuesFound {
                total: report.issue_count(),
                summary: report.summary(),
            })
            .await;
        } else if !report.is_clean() {
            debug!(
                "Integrity sweep: no new issues, {} known issues still open",
                report.previously_known
            );
        } else {
            debug!("Integrity sweep clean");
        }

        Ok(report)
    }

    /// Run the cleanup routine for each issue category in `report`. Every
    /// routine is idempotent; re-running over the same report is safe, and a
    /// fix that fails here comes back on the next sweep's report.
    pub async fn remediate(&self, report: &IntegrityReport) -> Result<IntegrityRemediation> {
        let mut remediation = IntegrityRemediation::default();

        // Invalid indexes: drop, except those mid-build right now. An
        // in-flight CREATE INDEX CONCURRENTLY shows an invalid entry by
        // design until it finishes.
        let in_flight: HashSet<String> = self
            .tracker
            .active_builds()
            .into_iter()
            .map(|b| b.index_name)
            .collect();
        for row in &report.invalid_indexes {
            if in_flight.contains(&row.index_name) {
                remediation.invalid_skipped_in_build += 1;
                continue;
            }
            let mut conn = self.db.dedicated_connection().await?;
            let dropped =
                catalog::drop_index(&mut conn, &row.schema_name, &row.index_name, false).await;
            conn.close().await.ok();
            match dropped {
                Ok(()) => {
                    info!(
                        "🧹 Dropped invalid index '{}.{}' left by a failed build",
                        row.schema_name, row.index_name
                    );
                    remediation.invalid_dropped += 1;
                }
                Err(e) => warn!(
                    "Could not drop invalid index '{}.{}': {}",
                    row.schema_name, row.index_name, e
                ),
            }
        }

        // Orphaned entries: attempt the drop; failures stay in the report
        // stream as alerts.
        for row in &report.orphaned_indexes {
            let mut conn = self.db.dedicated_connection().await?;
            let dropped =
                catalog::drop_index(&mut conn, &row.schema_name, &row.index_name, false).await;
            conn.close().await.ok();
            match dropped {
                Ok(()) => {
                    warn!(
                        "🧹 Dropped orphaned index entry '{}.{}'",
                        row.schema_name, row.index_name
                    );
                    remediation.orphans_dropped += 1;
                }
                Err(e) => error!(
                    "Orphaned index '{}.{}' could not be dropped: {}; manual repair needed",
                    row.schema_name, row.index_name, e
                ),
            }
        }

        // Stale advisory locks: release anything this engine's sessions may
        // have leaked. Locks owned by other applications are report-only.
        if !report.stale_advisory_locks.is_empty() {
            let mut conn = self.db.dedicated_connection().await?;
            catalog::advisory_unlock_all(&mut conn).await?;
            conn.close().await.ok();
            remediation.own_session_locks_released = true;
            for lock in &report.stale_advisory_locks {
                warn!(
                    "Stale advisory lock {} (pid {}) has no live session",
                    lock.key, lock.pid
                );
            }
        }

        // Stuck operations: clear the registration so the resource unblocks.
        if !report.stuck_operations.is_empty() {
            let cleared = self
                .registry
                .clear_stuck_at(Utc::now(), self.max_operation_age);
            remediation.operations_cleared = cleared.len();
        }

        let fixed = remediation.invalid_dropped
            + remediation.orphans_dropped
            + remediation.operations_cleared;
        if fixed > 0 {
            self.metrics.record_integrity_remediated(fixed as u64);
            info!(
                "Integrity remediation: {} invalid dropped, {} orphans dropped, {} operations cleared",
                remediation.invalid_dropped,
                remediation.orphans_dropped,
                remediation.operations_cleared
            );
        }

        Ok(remediation)
    }

    /// One background sweep cycle: check, then remediate when configured.
    pub async fn run_integrity_sweep(&self) -> Result<(IntegrityReport, Option<IntegrityRemediation>)> {
        let report = self.check_database_integrity().await?;
        if self.remediate_by_default && !report.is_clean() {
            let remediation = self.remediate(&report).await?;
            return Ok((report, Some(remediation)));
        }
        Ok((report, None))
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &OperationRegistry {
        &self.registry
    }
}
