// Audit event sink
//
// Mutations and safety events are reported to an optional sink. The engine
// never depends on a sink being present; when none is wired in, events only
// reach the tracing pipeline through component-level logging.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, warn};

/// A schema mutation or safety event worth recording outside the process.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    IndexCreated {
        index_name: String,
        table_name: String,
        elapsed_seconds: f64,
    },
    IndexCreationFailed {
        index_name: String,
        table_name: String,
        cause: String,
    },
    IndexRemoved {
        index_name: String,
        table_name: String,
        size_bytes: i64,
        dry_run: bool,
    },
    Reindexed {
        index_name: String,
        table_name: String,
        blocking: bool,
    },
    BlockingReindexFallback {
        index_name: String,
        table_name: String,
        reason: String,
    },
    IntegrityIssuesFound {
        total: usize,
        summary: String,
    },
    RollbackFailure {
        operation: String,
        resource: String,
        detail: String,
    },
    MaintenanceCompleted {
        cadences: Vec<String>,
        errors: usize,
    },
    EngineToggled {
        enabled: bool,
    },
}

impl AuditEvent {
    /// Stable tag for filtering in downstream systems.
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::IndexCreated { .. } => "index_created",
            AuditEvent::IndexCreationFailed { .. } => "index_creation_failed",
            AuditEvent::IndexRemoved { .. } => "index_removed",
            AuditEvent::Reindexed { .. } => "reindexed",
            AuditEvent::BlockingReindexFallback { .. } => "blocking_reindex_fallback",
            AuditEvent::IntegrityIssuesFound { .. } => "integrity_issues_found",
            AuditEvent::RollbackFailure { .. } => "rollback_failure",
            AuditEvent::MaintenanceCompleted { .. } => "maintenance_completed",
            AuditEvent::EngineToggled { .. } => "engine_toggled",
        }
    }
}

/// Destination for audit events. Implementations must tolerate being called
/// from any engine task and should never block for long.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// Default sink: structured JSON lines on the `curator::audit` target.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_else(|_| event.kind().to_string());
        match &event {
            AuditEvent::RollbackFailure { .. } => {
                error!(target: "curator::audit", "{}", payload)
            }
            AuditEvent::IntegrityIssuesFound { .. }
            | AuditEvent::BlockingReindexFallback { .. }
            | AuditEvent::IndexCreationFailed { .. } => {
                warn!(target: "curator::audit", "{}", payload)
            }
            _ => info!(target: "curator::audit", "{}", payload),
        }
    }
}
