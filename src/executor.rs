// Concurrent index build executor
//
// Builds indexes with CREATE INDEX CONCURRENTLY on a dedicated autocommit
// connection; the statement cannot run inside a transaction. The advisory
// lock taken here guards scheduling only (two engines racing to start the
// same build) and is released immediately before the build statement so the
// long-running build never pins it.
//
// Trust nothing after the build: the index is declared good only when
// pg_index reports it valid, ready, and live. Anything else is torn down.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sqlx::Connection;
use tracing::{info, warn};

use crate::database::{Database, catalog};
use crate::error::{CreationFailure, CuratorError, Result};
use crate::locks::{advisory_unlock, try_advisory_lock};
use crate::progress::BuildTracker;
use crate::throttle::ThrottleGovernor;
use crate::utils::sql::{is_valid_identifier, rewrite_create_index_concurrently, split_qualified};

/// How urgently the caller wants this mutation. Carried through logs and
/// audit events; the engine never queues, so priority does not reorder work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl fmt::Display for MutationPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationPriority::Low => "low",
            MutationPriority::Normal => "normal",
            MutationPriority::High => "high",
        };
        f.write_str(name)
    }
}

/// A request to create one index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationRequest {
    /// Target table, optionally schema-qualified (`audit.events`)
    pub table: String,
    /// Column or expression the index covers, for logs and audit
    pub field: String,
    /// Name the index must end up with
    pub index_name: String,
    /// CREATE INDEX template; rewritten to the concurrent form before use
    pub index_sql: String,
    #[serde(default)]
    pub priority: MutationPriority,
}

impl MutationRequest {
    /// Validate every identifier before anything touches the server.
    pub fn validate(&self) -> Result<()> {
        let (schema, table) = split_qualified(&self.table);
        for (label, value) in [
            ("schema", schema.as_str()),
            ("table", table.as_str()),
            ("index name", self.index_name.as_str()),
        ] {
            if !is_valid_identifier(value) {
                return Err(CuratorError::IndexCreation {
                    index_name: self.index_name.clone(),
                    cause: CreationFailure::InvalidDefinition,
                    detail: format!("{} '{}' is not a valid identifier", label, value),
                });
            }
        }
        Ok(())
    }
}

/// What a finished creation looked like.
#[derive(Debug, Clone, Serialize)]
pub struct CreationReport {
    pub index_name: String,
    pub table_name: String,
    pub elapsed_seconds: f64,
    /// False when the index already existed and was healthy
    pub created: bool,
    pub cpu_ceiling_breached: bool,
}

pub struct BuildExecutor {
    db: Arc<Database>,
    throttle: Arc<ThrottleGovernor>,
    tracker: Arc<BuildTracker>,
    default_statement_timeout: Duration,
}

impl BuildExecutor {
    pub fn new(
        db: Arc<Database>,
        throttle: Arc<ThrottleGovernor>,
        tracker: Arc<BuildTracker>,
        default_statement_timeout: Duration,
    ) -> Self {
        Self {
            db,
            throttle,
            tracker,
            default_statement_timeout,
        }
    }

    /// Build the requested index without blocking writers.
    ///
    /// Protocol: short-circuit on an already-healthy index, take the
    /// scheduling advisory lock on a dedicated connection, register the
    /// build, release the advisory lock, run the build under CPU watch,
    /// then verify against pg_index. An index that fails verification is
    /// dropped before the error is returned.
    pub async fn build_index(
        &self,
        request: &MutationRequest,
        statement_timeout: Option<Duration>,
    ) -> Result<CreationReport> {
        let started = Instant::now();
        let (schema, table) = split_qualified(&request.table);
        let qualified_table = format!("{}.{}", schema, table);

        // Idempotency: a healthy index with this name means done.
        if let Some(existing) =
            catalog::index_validity(self.db.pool(), &schema, &request.index_name).await?
        {
            if existing.is_healthy() {
                info!(
                    "Index '{}' already exists on '{}' and is healthy",
                    request.index_name, qualified_table
                );
                return Ok(CreationReport {
                    index_name: request.index_name.clone(),
                    table_name: qualified_table,
                    elapsed_seconds: started.elapsed().as_secs_f64(),
                    created: false,
                    cpu_ceiling_breached: false,
                });
            }
        }

        let build_sql = rewrite_create_index_concurrently(&request.index_sql, &request.index_name)?;

        let mut conn = self.db.dedicated_connection().await?;

        // Scheduling protection across engine instances.
        let granted = match try_advisory_lock(&mut conn, &qualified_table).await {
            Ok(granted) => granted,
            Err(e) => {
                conn.close().await.ok();
                return Err(e);
            }
        };
        if !granted {
            conn.close().await.ok();
            return Err(CuratorError::IndexCreation {
                index_name: request.index_name.clone(),
                cause: CreationFailure::LockUnavailable,
                detail: format!(
                    "another session is already mutating '{}'",
                    qualified_table
                ),
            });
        }

        self.tracker.track(&request.index_name, &qualified_table);
        info!(
            "🛠️ Building index '{}' on '{}' ({} priority)",
            request.index_name, qualified_table, request.priority
        );

        let timeout = statement_timeout.unwrap_or(self.default_statement_timeout);
        if let Err(e) = catalog::set_statement_timeout(&mut conn, timeout.as_millis() as u64).await
        {
            self.tracker.fail(&request.index_name);
            advisory_unlock(&mut conn, &qualified_table).await.ok();
            conn.close().await.ok();
            return Err(e);
        }

        // The build can run for hours; holding the advisory lock that long
        // would block every other scheduling decision for this table.
        if let Err(e) = advisory_unlock(&mut conn, &qualified_table).await {
            self.tracker.fail(&request.index_name);
            conn.close().await.ok();
            return Err(e);
        }

        let monitor_name = format!("CREATE INDEX {}", request.index_name);
        let (build_result, cpu_ceiling_breached) = Arc::clone(&self.throttle)
            .monitor_during_operation(&monitor_name, async {
                sqlx::query(&build_sql).execute(&mut conn).await
            })
            .await;

        if let Err(e) = build_result {
            self.tracker.fail(&request.index_name);
            conn.close().await.ok();
            let classified = classify_build_error(&request.index_name, e);
            warn!("Index build '{}' failed: {}", request.index_name, classified);
            return Err(classified);
        }

        // Fresh cursor for verification; never trust the build statement's
        // success alone.
        let verdict = self
            .verify_built_index(&mut conn, &schema, &request.index_name)
            .await;
        conn.close().await.ok();

        match verdict {
            Ok(()) => {
                self.tracker.complete(&request.index_name);
                self.throttle.mark_mutation_complete();
                let elapsed_seconds = started.elapsed().as_secs_f64();
                info!(
                    "✅ Index '{}' built and verified on '{}' in {:.1}s",
                    request.index_name, qualified_table, elapsed_seconds
                );
                Ok(CreationReport {
                    index_name: request.index_name.clone(),
                    table_name: qualified_table,
                    elapsed_seconds,
                    created: true,
                    cpu_ceiling_breached,
                })
            }
            Err(e) => {
                self.tracker.fail(&request.index_name);
                Err(e)
            }
        }
    }

    /// Check validity flags for a just-built index and tear it down when any
    /// flag is false. A drop failure is surfaced alongside the verification
    /// failure; the operator must know both.
    async fn verify_built_index(
        &self,
        conn: &mut sqlx::PgConnection,
        schema: &str,
        index_name: &str,
    ) -> Result<()> {
        let validity = catalog::index_validity(self.db.pool(), schema, index_name).await?;

        let flags = match validity {
            Some(v) if v.is_healthy() => return Ok(()),
            Some(v) => format!(
                "valid={}, ready={}, live={}",
                v.is_valid, v.is_ready, v.is_live
            ),
            None => {
                return Err(CuratorError::IndexCreation {
                    index_name: index_name.to_string(),
                    cause: CreationFailure::VerificationFailed,
                    detail: "index missing from catalog after build".to_string(),
                });
            }
        };

        warn!(
            "Index '{}' failed verification ({}); dropping it",
            index_name, flags
        );
        match catalog::drop_index(conn, schema, index_name, false).await {
            Ok(()) => Err(CuratorError::IndexCreation {
                index_name: index_name.to_string(),
                cause: CreationFailure::VerificationFailed,
                detail: format!("index failed validity check ({}); invalid index dropped", flags),
            }),
            Err(drop_err) => Err(CuratorError::IndexCreation {
                index_name: index_name.to_string(),
                cause: CreationFailure::VerificationFailed,
                detail: format!(
                    "index failed validity check ({}); drop of invalid index also failed: {}",
                    flags, drop_err
                ),
            }),
        }
    }
}

/// Map a server error from the build statement onto the failure taxonomy.
pub(crate) fn classify_build_error(index_name: &str, error: sqlx::Error) -> CuratorError {
    let cause = match &error {
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            Some("55P03") => CreationFailure::LockUnavailable,
            Some("57014") => CreationFailure::Timeout,
            Some("42P07") => CreationFailure::DuplicateIndex,
            Some("42501") => CreationFailure::PermissionDenied,
            _ => CreationFailure::Build,
        },
        _ => CreationFailure::Build,
    };
    CuratorError::IndexCreation {
        index_name: index_name.to_string(),
        cause,
        detail: error.to_string(),
    }
}
