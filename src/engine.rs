// Engine facade
//
// Wires the throttle governor, lock coordinator, build executor, progress
// tracker, safe-operation wrapper, and lifecycle orchestrator into one
// entry point. Callers never touch the components directly; every mutation
// flows through here so the safeguard accounting stays in one place.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditSink, TracingAuditSink};
use crate::config::EngineConfig;
use crate::database::{Database, catalog};
use crate::error::{CreationFailure, CuratorError, Result};
use crate::executor::{BuildExecutor, CreationReport, MutationRequest};
use crate::lifecycle::{
    LifecycleOrchestrator, LifecycleStatus, MaintenanceReport, ReindexedIndex, RemovedIndex,
};
use crate::locks::{ActiveLockInfo, LockCoordinator, LockKind};
use crate::metrics::{MetricsSnapshot, SafeguardMetrics};
use crate::progress::{ActiveBuildInfo, BuildProgress, BuildTracker};
use crate::resilience::{ActiveOperation, IntegrityRemediation, IntegrityReport, SafeOperations};
use crate::throttle::{ThrottleGovernor, ThrottleStatus};
use crate::utils::sql::split_qualified;

/// Per-request switches for index creation.
#[derive(Debug, Clone)]
pub struct CreationOptions {
    /// When false the CPU/pacing gate is skipped (operator override). The
    /// pacing stamp still updates on success.
    pub respect_cpu_throttle: bool,

    /// Override the configured statement_timeout for this one build
    pub statement_timeout: Option<Duration>,
}

impl Default for CreationOptions {
    fn default() -> Self {
        Self {
            respect_cpu_throttle: true,
            statement_timeout: None,
        }
    }
}

/// The index mutation and lifecycle engine.
pub struct CuratorEngine {
    config: EngineConfig,
    db: Arc<Database>,
    metrics: Arc<SafeguardMetrics>,
    throttle: Arc<ThrottleGovernor>,
    locks: Arc<LockCoordinator>,
    tracker: Arc<BuildTracker>,
    safe_ops: Arc<SafeOperations>,
    executor: Arc<BuildExecutor>,
    lifecycle: LifecycleOrchestrator,
    audit: Option<Arc<dyn AuditSink>>,
}

impl CuratorEngine {
    /// Connect with the default audit sink (JSON lines via tracing).
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        Self::connect_with(config, Some(Arc::new(TracingAuditSink))).await
    }

    /// Connect with a caller-supplied audit sink, or none at all.
    pub async fn connect_with(
        config: EngineConfig,
        audit: Option<Arc<dyn AuditSink>>,
    ) -> Result<Self> {
        let db = Arc::new(Database::connect(&config.database).await?);
        let metrics = Arc::new(SafeguardMetrics::new());
        let throttle = Arc::new(ThrottleGovernor::new(&config.throttle, Arc::clone(&metrics)));
        let locks = Arc::new(LockCoordinator::new(&config.locks, Arc::clone(&metrics)));
        let tracker = Arc::new(BuildTracker::new(Arc::clone(&db), &config.builds));
        let safe_ops = Arc::new(SafeOperations::new(
            Arc::clone(&db),
            Arc::clone(&tracker),
            Arc::clone(&metrics),
            audit.clone(),
            &config.operations,
            &config.integrity,
        ));
        let executor = Arc::new(BuildExecutor::new(
            Arc::clone(&db),
            Arc::clone(&throttle),
            Arc::clone(&tracker),
            config.builds.statement_timeout(),
        ));
        let lifecycle = LifecycleOrchestrator::new(
            Arc::clone(&db),
            Arc::clone(&safe_ops),
            Arc::clone(&locks),
            Arc::clone(&throttle),
            audit.clone(),
            config.lifecycle.clone(),
            &config.throttle,
        );

        throttle.log_startup();
        Ok(Self {
            config,
            db,
            metrics,
            throttle,
            locks,
            tracker,
            safe_ops,
            executor,
            lifecycle,
            audit,
        })
    }

    /// Create an index without blocking writers.
    ///
    /// Every request passes the full safeguard chain: identifier validation,
    /// the in-process resource lock, the CPU/pacing gate, then a safe scope
    /// that re-checks the table before the build runs.
    pub async fn request_index_creation(
        &self,
        request: MutationRequest,
        options: &CreationOptions,
    ) -> Result<CreationReport> {
        self.metrics.record_creation_attempt();
        let outcome = self.create_index_inner(&request, options).await;

        match &outcome {
            Ok(report) => {
                self.metrics.record_creation_success();
                if report.created {
                    self.emit(AuditEvent::IndexCreated {
                        index_name: report.index_name.clone(),
                        table_name: report.table_name.clone(),
                        elapsed_seconds: report.elapsed_seconds,
                    })
                    .await;
                }
            }
            Err(CuratorError::Throttled { .. }) => self.metrics.record_creation_throttled(),
            Err(CuratorError::ResourceBusy { .. }) => self.metrics.record_creation_blocked(),
            Err(e) => {
                self.metrics.record_creation_failure();
                if let CuratorError::IndexCreation {
                    cause: CreationFailure::LockUnavailable,
                    ..
                } = e
                {
                    // Another engine's advisory lock is a block, not a defect
                    self.metrics.record_creation_blocked();
                }
                self.emit(AuditEvent::IndexCreationFailed {
                    index_name: request.index_name.clone(),
                    table_name: request.table.clone(),
                    cause: e.to_string(),
                })
                .await;
            }
        }

        outcome
    }

    async fn create_index_inner(
        &self,
        request: &MutationRequest,
        options: &CreationOptions,
    ) -> Result<CreationReport> {
        request.validate()?;
        let (schema, table) = split_qualified(&request.table);
        let qualified_table = format!("{}.{}", schema, table);

        let _guard = self
            .locks
            .acquire(LockKind::IndexCreation, &qualified_table, None)?;

        if options.respect_cpu_throttle {
            let decision = self.throttle.should_throttle();
            if let Some(reason) = &decision.reason {
                warn!(
                    "⏳ Declining index '{}': {} (retry in {}s)",
                    request.index_name,
                    reason,
                    decision.wait_seconds()
                );
                return Err(CuratorError::Throttled {
                    reason: reason.to_string(),
                    wait_seconds: decision.wait_seconds(),
                });
            }
        } else {
            debug!(
                "CPU throttle override for index '{}' (operator request)",
                request.index_name
            );
        }

        let executor = Arc::clone(&self.executor);
        let scoped_request = request.clone();
        let timeout = options.statement_timeout;
        let scoped_schema = schema.clone();
        let scoped_table = table.clone();

        let report = self
            .safe_ops
            .run("index-creation", &qualified_table, move |tx| {
                Box::pin(async move {
                    if !catalog::table_exists(&mut **tx, &scoped_schema, &scoped_table).await? {
                        return Err(CuratorError::IndexCreation {
                            index_name: scoped_request.index_name.clone(),
                            cause: CreationFailure::InvalidDefinition,
                            detail: format!(
                                "table '{}.{}' does not exist",
                                scoped_schema, scoped_table
                            ),
                        });
                    }
                    executor.build_index(&scoped_request, timeout).await
                })
            })
            .await?;

        if report.created {
            self.lifecycle.note_table_indexed(&schema, &table);
        }
        Ok(report)
    }

    /// Drop unused indexes outside the weekly cadence. Guarded against
    /// overlapping cleanup invocations, including the scheduler's.
    pub async fn request_index_cleanup(
        &self,
        min_scans: i64,
        days_unused: i64,
        dry_run: bool,
    ) -> Result<Vec<RemovedIndex>> {
        let _guard = self
            .locks
            .acquire(LockKind::IndexRemoval, "index-cleanup", None)?;
        self.lifecycle
            .cleanup_unused_indexes(min_scans, days_unused, dry_run)
            .await
    }

    /// Rebuild bloated indexes outside the weekly cadence.
    pub async fn request_reindex(
        &self,
        bloat_threshold_percent: f64,
        min_size_mb: i64,
        dry_run: bool,
    ) -> Result<Vec<ReindexedIndex>> {
        let _guard = self.locks.acquire(LockKind::Reindex, "reindex", None)?;
        self.lifecycle
            .reindex_bloated(bloat_threshold_percent, min_size_mb, dry_run)
            .await
    }

    /// Run every due maintenance cadence now; `force` ignores the schedule.
    pub async fn run_maintenance_pass(&self, force: bool) -> Result<MaintenanceReport> {
        self.lifecycle.run_maintenance_pass(force).await
    }

    /// Sweep for invalid indexes, orphaned entries, stale advisory locks and
    /// stuck operations. `remediate` overrides the configured default.
    pub async fn check_integrity(
        &self,
        remediate: bool,
    ) -> Result<(IntegrityReport, Option<IntegrityRemediation>)> {
        let _guard = self
            .locks
            .acquire(LockKind::Integrity, "integrity-sweep", None)?;
        let report = self.safe_ops.check_database_integrity().await?;
        let remediation = if remediate && !report.is_clean() {
            Some(self.safe_ops.remediate(&report).await?)
        } else {
            None
        };
        Ok((report, remediation))
    }

    /// Kill switch. Disabling fails every new mutating operation fast;
    /// reads and status calls keep working.
    pub async fn set_enabled(&self, enabled: bool) {
        self.safe_ops.set_enabled(enabled);
        self.emit(AuditEvent::EngineToggled { enabled }).await;
    }

    pub fn is_enabled(&self) -> bool {
        self.safe_ops.is_enabled()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn active_locks(&self) -> Vec<ActiveLockInfo> {
        self.locks.active_locks()
    }

    pub fn active_builds(&self) -> Vec<ActiveBuildInfo> {
        self.tracker.active_builds()
    }

    pub async fn build_progress(&self, index_name: &str) -> Result<BuildProgress> {
        self.tracker.get_progress(index_name).await
    }

    pub fn active_operations(&self) -> Vec<ActiveOperation> {
        self.safe_ops.active_operations()
    }

    pub fn throttle_status(&self) -> ThrottleStatus {
        self.throttle.status()
    }

    pub fn lifecycle_status(&self) -> LifecycleStatus {
        self.lifecycle.status()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Close the underlying pool. Background tasks must be shut down first.
    pub async fn close(&self) {
        self.db.close().await;
    }

    async fn emit(&self, event: AuditEvent) {
        if let Some(sink) = &self.audit {
            sink.record(event).await;
        }
    }

    /// Spawn the engine's background loops: CPU sampling, stale lock sweeps,
    /// build supervision, integrity sweeps, and the maintenance scheduler.
    pub fn start_background_tasks(self: Arc<Self>) -> BackgroundTasks {
        let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let engine = Arc::clone(&self);
        handles.push((
            "cpu-sampler",
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(engine.throttle.sample_interval());
                loop {
                    ticker.tick().await;
                    engine.throttle.sample_now();
                }
            }),
        ));

        let engine = Arc::clone(&self);
        let sweep_interval = Duration::from_secs(engine.config.locks.sweep_interval_seconds);
        handles.push((
            "lock-sweep",
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(sweep_interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let reclaimed = engine.locks.sweep_stale();
                    if !reclaimed.is_empty() {
                        debug!("Lock sweep reclaimed {} stale locks", reclaimed.len());
                    }
                }
            }),
        ));

        let engine = Arc::clone(&self);
        let poll_interval = Duration::from_secs(engine.config.builds.poll_interval_seconds);
        handles.push((
            "build-supervisor",
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(poll_interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    engine.tracker.poll_all().await;
                }
            }),
        ));

        let engine = Arc::clone(&self);
        let integrity_interval =
            Duration::from_secs(engine.config.integrity.sweep_interval_seconds);
        handles.push((
            "integrity-sweep",
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(integrity_interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = engine.safe_ops.run_integrity_sweep().await {
                        warn!("Integrity sweep failed: {}", e);
                    }
                }
            }),
        ));

        if self.config.lifecycle.enabled {
            let engine = Arc::clone(&self);
            let check_interval =
                Duration::from_secs(engine.config.lifecycle.check_interval_seconds);
            handles.push((
                "lifecycle-scheduler",
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(check_interval);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        match engine.lifecycle.run_maintenance_pass(false).await {
                            Ok(_) => {}
                            Err(CuratorError::ResourceBusy { .. }) => {
                                debug!("Maintenance pass already running; scheduler skipping");
                            }
                            Err(e) => warn!("Scheduled maintenance pass failed: {}", e),
                        }
                    }
                }),
            ));
        }

        info!("🚀 Engine background tasks started ({})", handles.len());
        BackgroundTasks { handles }
    }
}

/// Handles for the engine's spawned loops.
pub struct BackgroundTasks {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    pub fn task_count(&self) -> usize {
        self.handles.len()
    }

    /// Stop every background loop. Aborting is safe: each loop only ever
    /// awaits between whole units of work or inside catalog reads.
    pub fn shutdown(self) {
        for (name, handle) in self.handles {
            handle.abort();
            debug!("Stopped background task: {}", name);
        }
        info!("Engine background tasks stopped");
    }
}
