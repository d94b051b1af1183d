// Resource lock coordinator
//
// In-process, non-queuing locks keyed by (kind, resource). A second request
// for a held resource fails immediately with ResourceBusy; callers retry or
// give up, they never wait in line. Guards release on drop so every exit
// path (including panics and early returns) releases exactly once.
//
// Cross-process coordination is a separate mechanism: PostgreSQL session
// advisory locks, taken on the dedicated build connection (see helpers at
// the bottom).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgConnection;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{CuratorError, Result};
use crate::metrics::SafeguardMetrics;
use crate::utils::sql::advisory_lock_key;

/// What a lock protects the resource for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    IndexCreation,
    IndexRemoval,
    Reindex,
    Maintenance,
    Integrity,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockKind::IndexCreation => "index_creation",
            LockKind::IndexRemoval => "index_removal",
            LockKind::Reindex => "reindex",
            LockKind::Maintenance => "maintenance",
            LockKind::Integrity => "integrity",
        };
        f.write_str(name)
    }
}

/// Bookkeeping for one held lock.
#[derive(Debug, Clone)]
pub struct TrackedLock {
    pub lock_id: Uuid,
    pub kind: LockKind,
    pub resource: String,
    pub acquired_at: DateTime<Utc>,
    pub timeout: Duration,
}

/// Operator-facing view of a held lock.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveLockInfo {
    pub kind: LockKind,
    pub resource: String,
    pub held_seconds: i64,
    pub timeout_seconds: u64,
}

/// A lock reclaimed by the stale sweep.
#[derive(Debug, Clone)]
pub struct StaleLockReport {
    pub kind: LockKind,
    pub resource: String,
    pub held_seconds: i64,
}

type LockMap = Arc<Mutex<HashMap<(LockKind, String), TrackedLock>>>;

pub struct LockCoordinator {
    locks: LockMap,
    metrics: Arc<SafeguardMetrics>,
    default_timeout: Duration,
}

impl LockCoordinator {
    pub fn new(config: &LockConfig, metrics: Arc<SafeguardMetrics>) -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
            metrics,
            default_timeout: config.default_timeout(),
        }
    }

    /// Try to take the lock for (kind, resource). Fails fast when held.
    pub fn acquire(
        &self,
        kind: LockKind,
        resource: &str,
        timeout: Option<Duration>,
    ) -> Result<ResourceLockGuard> {
        let key = (kind, resource.to_string());
        let mut locks = self.locks.lock().unwrap();

        if let Some(existing) = locks.get(&key) {
            let held = (Utc::now() - existing.acquired_at).num_seconds();
            debug!(
                "Lock contention: {} on '{}' held for {}s",
                kind, resource, held
            );
            return Err(CuratorError::ResourceBusy {
                resource: resource.to_string(),
                operation: kind.to_string(),
            });
        }

        let lock = TrackedLock {
            lock_id: Uuid::new_v4(),
            kind,
            resource: resource.to_string(),
            acquired_at: Utc::now(),
            timeout: timeout.unwrap_or(self.default_timeout),
        };
        let lock_id = lock.lock_id;
        locks.insert(key.clone(), lock);
        debug!("🔒 Acquired {} lock on '{}'", kind, resource);

        Ok(ResourceLockGuard {
            locks: Arc::clone(&self.locks),
            key: Some(key),
            lock_id,
        })
    }

    /// Every lock currently held, oldest first.
    pub fn active_locks(&self) -> Vec<ActiveLockInfo> {
        let locks = self.locks.lock().unwrap();
        let now = Utc::now();
        let mut active: Vec<ActiveLockInfo> = locks
            .values()
            .map(|lock| ActiveLockInfo {
                kind: lock.kind,
                resource: lock.resource.clone(),
                held_seconds: (now - lock.acquired_at).num_seconds(),
                timeout_seconds: lock.timeout.as_secs(),
            })
            .collect();
        active.sort_by(|a, b| b.held_seconds.cmp(&a.held_seconds));
        active
    }

    pub fn held_count(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    pub fn is_held(&self, kind: LockKind, resource: &str) -> bool {
        self.locks
            .lock()
            .unwrap()
            .contains_key(&(kind, resource.to_string()))
    }

    /// Reclaim locks held past twice their timeout. A lock that old means an
    /// operation died without dropping its guard (or the process is wedged);
    /// reclaiming keeps one casualty from blocking its table forever.
    pub fn sweep_stale(&self) -> Vec<StaleLockReport> {
        self.sweep_stale_at(Utc::now())
    }

    pub(crate) fn sweep_stale_at(&self, now: DateTime<Utc>) -> Vec<StaleLockReport> {
        let mut locks = self.locks.lock().unwrap();
        let mut reclaimed = Vec::new();

        locks.retain(|_, lock| {
            let held_seconds = (now - lock.acquired_at).num_seconds().max(0) as u64;
            if held_seconds > lock.timeout.as_secs().saturating_mul(2) {
                warn!(
                    "⚠️ Reclaiming stale {} lock on '{}' held {}s (timeout {}s); possible abandoned operation",
                    lock.kind,
                    lock.resource,
                    held_seconds,
                    lock.timeout.as_secs()
                );
                reclaimed.push(StaleLockReport {
                    kind: lock.kind,
                    resource: lock.resource.clone(),
                    held_seconds: held_seconds as i64,
                });
                false
            } else {
                true
            }
        });

        for _ in &reclaimed {
            self.metrics.record_stale_lock_reclaimed();
        }
        reclaimed
    }

    /// Insert a lock with a back-dated acquisition time. Test scaffolding for
    /// the stale sweep.
    #[cfg(test)]
    pub(crate) fn insert_backdated(
        &self,
        kind: LockKind,
        resource: &str,
        acquired_at: DateTime<Utc>,
        timeout: Duration,
    ) -> Uuid {
        let lock = TrackedLock {
            lock_id: Uuid::new_v4(),
            kind,
            resource: resource.to_string(),
            acquired_at,
            timeout,
        };
        let id = lock.lock_id;
        self.locks
            .lock()
            .unwrap()
            .insert((kind, resource.to_string()), lock);
        id
    }
}

/// RAII handle for a held resource lock. Dropping releases the lock unless
/// the stale sweep already reclaimed it (release is keyed by lock id so a
/// successor's lock is never clobbered).
pub struct ResourceLockGuard {
    locks: LockMap,
    key: Option<(LockKind, String)>,
    lock_id: Uuid,
}

impl ResourceLockGuard {
    pub fn lock_id(&self) -> Uuid {
        self.lock_id
    }

    /// Release explicitly. Equivalent to dropping the guard.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let mut locks = self.locks.lock().unwrap();
        match locks.get(&key) {
            Some(current) if current.lock_id == self.lock_id => {
                locks.remove(&key);
                debug!("🔓 Released {} lock on '{}'", key.0, key.1);
            }
            Some(_) => {
                // Reclaimed by the sweep and re-acquired by someone else.
                warn!(
                    "Lock on '{}' was reclaimed while this operation ran; leaving successor's lock in place",
                    key.1
                );
            }
            None => {
                debug!("Lock on '{}' already reclaimed by stale sweep", key.1);
            }
        }
    }
}

impl Drop for ResourceLockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

// --- PostgreSQL session advisory locks -------------------------------------
//
// Scheduling-time coordination across engine instances. Acquire and release
// must happen on the same connection; callers use the dedicated build
// connection, never the pool.

/// Try to take a session advisory lock for `resource` on `conn`.
pub async fn try_advisory_lock(conn: &mut PgConnection, resource: &str) -> Result<bool> {
    let key = advisory_lock_key(resource);
    let granted: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
        .bind(key)
        .fetch_one(&mut *conn)
        .await?;
    if granted {
        debug!("🔐 Advisory lock {} granted for '{}'", key, resource);
    } else {
        debug!("Advisory lock {} for '{}' held elsewhere", key, resource);
    }
    Ok(granted)
}

/// Release a session advisory lock taken by `try_advisory_lock`.
pub async fn advisory_unlock(conn: &mut PgConnection, resource: &str) -> Result<bool> {
    let key = advisory_lock_key(resource);
    let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
        .bind(key)
        .fetch_one(&mut *conn)
        .await?;
    if !released {
        warn!(
            "Advisory unlock for '{}' returned false; lock was not held by this session",
            resource
        );
    }
    Ok(released)
}
