// Build progress tracker
//
// In-memory registry of concurrent index builds, refreshed from
// pg_stat_progress_create_index when the server has it (12+) and from
// pg_stat_activity when it does not. Progress is advisory: when neither
// source has anything, the answer is Unknown, never an error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::BuildConfig;
use crate::database::{Database, catalog};
use crate::error::Result;

/// Where a tracked build currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Building,
    Hanging,
}

/// Registry entry for one in-flight build.
#[derive(Debug, Clone, Serialize)]
pub struct ConcurrentBuild {
    pub index_name: String,
    pub table_name: String,
    pub started_at: DateTime<Utc>,
    pub phase: Option<String>,
    pub tuples_done: Option<i64>,
    pub tuples_total: Option<i64>,
    pub status: BuildStatus,
}

/// One-shot progress answer for an index build.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BuildProgress {
    /// The index exists and passed its validity flags.
    Complete,
    /// Live row from the server's progress view.
    InProgress {
        phase: String,
        tuples_done: i64,
        tuples_total: i64,
    },
    /// Progress view unavailable; a matching statement is still running.
    ActiveStatement {
        query: String,
        running_seconds: Option<i64>,
    },
    /// No evidence either way.
    Unknown,
}

/// Operator-facing view of one tracked build.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveBuildInfo {
    pub index_name: String,
    pub table_name: String,
    pub status: BuildStatus,
    pub phase: Option<String>,
    pub progress_percent: Option<f64>,
    pub running_seconds: i64,
}

pub struct BuildTracker {
    db: Arc<Database>,
    builds: Mutex<HashMap<String, ConcurrentBuild>>,
    progress_view: OnceCell<bool>,
    hang_threshold: Duration,
}

impl BuildTracker {
    pub fn new(db: Arc<Database>, config: &BuildConfig) -> Self {
        Self {
            db,
            builds: Mutex::new(HashMap::new()),
            progress_view: OnceCell::new(),
            hang_threshold: Duration::seconds(config.hang_threshold_seconds as i64),
        }
    }

    /// Register a build the executor is about to start.
    pub fn track(&self, index_name: &str, table_name: &str) {
        let mut builds = self.builds.lock().unwrap();
        builds.insert(
            index_name.to_string(),
            ConcurrentBuild {
                index_name: index_name.to_string(),
                table_name: table_name.to_string(),
                started_at: Utc::now(),
                phase: None,
                tuples_done: None,
                tuples_total: None,
                status: BuildStatus::Building,
            },
        );
        info!("📊 Tracking build of '{}' on '{}'", index_name, table_name);
    }

    /// Deregister a build that finished and verified.
    pub fn complete(&self, index_name: &str) {
        if self.builds.lock().unwrap().remove(index_name).is_some() {
            debug!("Build of '{}' complete, tracking stopped", index_name);
        }
    }

    /// Deregister a build that failed or was torn down.
    pub fn fail(&self, index_name: &str) {
        if self.builds.lock().unwrap().remove(index_name).is_some() {
            debug!("Build of '{}' failed, tracking stopped", index_name);
        }
    }

    async fn progress_view_supported(&self) -> bool {
        *self
            .progress_view
            .get_or_init(|| async {
                let supported = catalog::supports_progress_view(self.db.pool()).await;
                if !supported {
                    warn!(
                        "pg_stat_progress_create_index unavailable; falling back to pg_stat_activity"
                    );
                }
                supported
            })
            .await
    }

    /// Current progress for one index build. Also refreshes the registry
    /// entry when the build is tracked.
    pub async fn get_progress(&self, index_name: &str) -> Result<BuildProgress> {
        let tracked = {
            let builds = self.builds.lock().unwrap();
            builds.get(index_name).cloned()
        };
        let table_name = tracked
            .as_ref()
            .map(|b| b.table_name.clone())
            .unwrap_or_default();

        // A healthy catalog entry trumps everything.
        let (schema, index) = crate::utils::sql::split_qualified(index_name);
        if let Some(validity) = catalog::index_validity(self.db.pool(), &schema, &index).await? {
            if validity.is_healthy() {
                self.complete(index_name);
                return Ok(BuildProgress::Complete);
            }
        }

        if self.progress_view_supported().await {
            if let Some(row) =
                catalog::build_progress(self.db.pool(), &index, &table_name).await?
            {
                let progress = BuildProgress::InProgress {
                    phase: row.phase.clone().unwrap_or_else(|| "unknown".to_string()),
                    tuples_done: row.tuples_done.unwrap_or(0),
                    tuples_total: row.tuples_total.unwrap_or(0),
                };
                let mut builds = self.builds.lock().unwrap();
                if let Some(entry) = builds.get_mut(index_name) {
                    entry.phase = row.phase;
                    entry.tuples_done = row.tuples_done;
                    entry.tuples_total = row.tuples_total;
                }
                return Ok(progress);
            }
        } else if let Some(row) =
            catalog::active_build_statement(self.db.pool(), &index).await?
        {
            return Ok(BuildProgress::ActiveStatement {
                query: row.query,
                running_seconds: row.running_seconds.map(|s| s as i64),
            });
        }

        Ok(BuildProgress::Unknown)
    }

    /// Refresh every tracked build. Poll failures degrade to a debug line;
    /// progress reporting must never take a build down.
    pub async fn poll_all(&self) {
        let names: Vec<String> = {
            let builds = self.builds.lock().unwrap();
            builds.keys().cloned().collect()
        };
        for name in names {
            match self.get_progress(&name).await {
                Ok(BuildProgress::InProgress {
                    phase,
                    tuples_done,
                    tuples_total,
                }) => {
                    debug!(
                        "Build '{}': {} ({}/{} tuples)",
                        name, phase, tuples_done, tuples_total
                    );
                }
                Ok(_) => {}
                Err(e) => debug!("Progress poll for '{}' failed: {}", name, e),
            }
        }
        self.check_hanging_builds();
    }

    /// Flag builds that have run past the hang threshold. Advisory only; the
    /// build keeps running and stays tracked.
    pub fn check_hanging_builds(&self) -> Vec<ConcurrentBuild> {
        self.check_hanging_at(Utc::now())
    }

    pub(crate) fn check_hanging_at(&self, now: DateTime<Utc>) -> Vec<ConcurrentBuild> {
        let mut builds = self.builds.lock().unwrap();
        let mut hanging = Vec::new();
        for entry in builds.values_mut() {
            if entry.status == BuildStatus::Building && now - entry.started_at > self.hang_threshold
            {
                entry.status = BuildStatus::Hanging;
                warn!(
                    "⚠️ Build of '{}' on '{}' has run {}s, past the {}s hang threshold",
                    entry.index_name,
                    entry.table_name,
                    (now - entry.started_at).num_seconds(),
                    self.hang_threshold.num_seconds()
                );
            }
            if entry.status == BuildStatus::Hanging {
                hanging.push(entry.clone());
            }
        }
        hanging
    }

    /// Every tracked build, longest-running first.
    pub fn active_builds(&self) -> Vec<ActiveBuildInfo> {
        let builds = self.builds.lock().unwrap();
        let now = Utc::now();
        let mut active: Vec<ActiveBuildInfo> = builds
            .values()
            .map(|b| ActiveBuildInfo {
                index_name: b.index_name.clone(),
                table_name: b.table_name.clone(),
                status: b.status,
                phase: b.phase.clone(),
                progress_percent: match (b.tuples_done, b.tuples_total) {
                    (Some(done), Some(total)) if total > 0 => {
                        Some((done as f64 / total as f64) * 100.0)
                    }
                    _ => None,
                },
                running_seconds: (now - b.started_at).num_seconds(),
            })
            .collect();
        active.sort_by(|a, b| b.running_seconds.cmp(&a.running_seconds));
        active
    }

    pub fn tracked_count(&self) -> usize {
        self.builds.lock().unwrap().len()
    }

    /// Back-date a tracked build. Test scaffolding for hang detection.
    #[cfg(test)]
    pub(crate) fn backdate(&self, index_name: &str, started_at: DateTime<Utc>) {
        let mut builds = self.builds.lock().unwrap();
        if let Some(entry) = builds.get_mut(index_name) {
            entry.started_at = started_at;
        }
    }
}
