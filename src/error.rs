use std::fmt;

use thiserror::Error;

/// Why an index build was rejected or torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreationFailure {
    /// Another session holds the advisory lock for the target table (SQLSTATE 55P03).
    LockUnavailable,
    /// The build exceeded its statement timeout (SQLSTATE 57014).
    Timeout,
    /// An index with this name already exists (SQLSTATE 42P07).
    DuplicateIndex,
    /// The role lacks privileges on the target relation (SQLSTATE 42501).
    PermissionDenied,
    /// The submitted definition was rejected before reaching the server.
    InvalidDefinition,
    /// The index was built but failed the validity/readiness/liveness check.
    VerificationFailed,
    /// Any other server-side build failure.
    Build,
}

impl CreationFailure {
    pub fn as_tag(&self) -> &'static str {
        match self {
            CreationFailure::LockUnavailable => "lock_unavailable",
            CreationFailure::Timeout => "timeout",
            CreationFailure::DuplicateIndex => "duplicate_index",
            CreationFailure::PermissionDenied => "permission_denied",
            CreationFailure::InvalidDefinition => "invalid_definition",
            CreationFailure::VerificationFailed => "verification_failed",
            CreationFailure::Build => "build",
        }
    }
}

impl fmt::Display for CreationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

#[derive(Debug, Error)]
pub enum CuratorError {
    #[error("resource busy: '{operation}' already running against '{resource}'")]
    ResourceBusy { resource: String, operation: String },

    #[error("mutation throttled: {reason} (retry in {wait_seconds}s)")]
    Throttled { reason: String, wait_seconds: u64 },

    #[error("index creation failed for '{index_name}' [{cause}]: {detail}")]
    IndexCreation {
        index_name: String,
        cause: CreationFailure,
        detail: String,
    },

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("rollback failed for operation '{operation}': {detail}")]
    RollbackFailure { operation: String, detail: String },

    #[error("engine is administratively disabled")]
    Disabled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CuratorError {
    /// Seconds the caller should wait before retrying, when the error is transient.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            CuratorError::Throttled { wait_seconds, .. } => Some(*wait_seconds),
            CuratorError::ResourceBusy { .. } => Some(5),
            CuratorError::IndexCreation {
                cause: CreationFailure::LockUnavailable,
                ..
            } => Some(30),
            _ => None,
        }
    }

    /// True for errors the caller can retry without operator intervention.
    pub fn is_transient(&self) -> bool {
        self.retry_after_seconds().is_some()
    }
}

pub type Result<T> = std::result::Result<T, CuratorError>;
