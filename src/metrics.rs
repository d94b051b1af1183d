// Safeguard metrics
//
// Plain atomic counters shared across every component. Readers get a
// consistent-enough snapshot for status reporting; nothing here persists
// across restarts.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct SafeguardMetrics {
    rate_limit_triggers: AtomicU64,
    cpu_throttle_triggers: AtomicU64,
    cpu_ceiling_warnings: AtomicU64,
    creation_attempts: AtomicU64,
    creation_successes: AtomicU64,
    creation_failures: AtomicU64,
    creation_throttled: AtomicU64,
    creation_blocked: AtomicU64,
    stale_locks_reclaimed: AtomicU64,
    integrity_issues_found: AtomicU64,
    integrity_issues_remediated: AtomicU64,
    rollback_failures: AtomicU64,
}

/// Point-in-time view of the counters plus derived rates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub rate_limit_triggers: u64,
    pub cpu_throttle_triggers: u64,
    pub cpu_ceiling_warnings: u64,
    pub creation_attempts: u64,
    pub creation_successes: u64,
    pub creation_failures: u64,
    pub creation_throttled: u64,
    pub creation_blocked: u64,
    pub stale_locks_reclaimed: u64,
    pub integrity_issues_found: u64,
    pub integrity_issues_remediated: u64,
    pub rollback_failures: u64,

    /// successes / attempts, 0.0 when nothing has been attempted
    pub success_rate: f64,

    /// Share of attempts stopped pre-flight by throttling or resource locks
    pub throttle_effectiveness: f64,
}

impl SafeguardMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_rate_limit_trigger(&self) {
        self.rate_limit_triggers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cpu_throttle_trigger(&self) {
        self.cpu_throttle_triggers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cpu_ceiling_warning(&self) {
        self.cpu_ceiling_warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_creation_attempt(&self) {
        self.creation_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_creation_success(&self) {
        self.creation_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_creation_failure(&self) {
        self.creation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_creation_throttled(&self) {
        self.creation_throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_creation_blocked(&self) {
        self.creation_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_lock_reclaimed(&self) {
        self.stale_locks_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_integrity_issues(&self, found: u64) {
        self.integrity_issues_found.fetch_add(found, Ordering::Relaxed);
    }

    pub fn record_integrity_remediated(&self, fixed: u64) {
        self.integrity_issues_remediated.fetch_add(fixed, Ordering::Relaxed);
    }

    pub fn record_rollback_failure(&self) {
        self.rollback_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let attempts = self.creation_attempts.load(Ordering::Relaxed);
        let successes = self.creation_successes.load(Ordering::Relaxed);
        let throttled = self.creation_throttled.load(Ordering::Relaxed);
        let blocked = self.creation_blocked.load(Ordering::Relaxed);

        let success_rate = if attempts > 0 {
            successes as f64 / attempts as f64
        } else {
            0.0
        };
        let throttle_effectiveness = if attempts > 0 {
            (throttled + blocked) as f64 / attempts as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            rate_limit_triggers: self.rate_limit_triggers.load(Ordering::Relaxed),
            cpu_throttle_triggers: self.cpu_throttle_triggers.load(Ordering::Relaxed),
            cpu_ceiling_warnings: self.cpu_ceiling_warnings.load(Ordering::Relaxed),
            creation_attempts: attempts,
            creation_successes: successes,
            creation_failures: self.creation_failures.load(Ordering::Relaxed),
            creation_throttled: throttled,
            creation_blocked: blocked,
            stale_locks_reclaimed: self.stale_locks_reclaimed.load(Ordering::Relaxed),
            integrity_issues_found: self.integrity_issues_found.load(Ordering::Relaxed),
            integrity_issues_remediated: self.integrity_issues_remediated.load(Ordering::Relaxed),
            rollback_failures: self.rollback_failures.load(Ordering::Relaxed),
            success_rate,
            throttle_effectiveness,
        }
    }

    /// Zero every counter. Used by operator tooling and tests.
    pub fn reset(&self) {
        self.rate_limit_triggers.store(0, Ordering::Relaxed);
        self.cpu_throttle_triggers.store(0, Ordering::Relaxed);
        self.cpu_ceiling_warnings.store(0, Ordering::Relaxed);
        self.creation_attempts.store(0, Ordering::Relaxed);
        self.creation_successes.store(0, Ordering::Relaxed);
        self.creation_failures.store(0, Ordering::Relaxed);
        self.creation_throttled.store(0, Ordering::Relaxed);
        self.creation_blocked.store(0, Ordering::Relaxed);
        self.stale_locks_reclaimed.store(0, Ordering::Relaxed);
        self.integrity_issues_found.store(0, Ordering::Relaxed);
        self.integrity_issues_remediated.store(0, Ordering::Relaxed);
        self.rollback_failures.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_are_zero_with_no_attempts() {
        let metrics = SafeguardMetrics::new();
        let snap = metrics.snapshot();
        assert_eq!(snap.success_rate, 0.0);
        assert_eq!(snap.throttle_effectiveness, 0.0);
    }

    #[test]
    fn success_rate_tracks_attempts() {
        let metrics = SafeguardMetrics::new();
        for _ in 0..4 {
            metrics.record_creation_attempt();
        }
        metrics.record_creation_success();
        metrics.record_creation_success();
        metrics.record_creation_success();
        metrics.record_creation_failure();

        let snap = metrics.snapshot();
        assert_eq!(snap.creation_attempts, 4);
        assert!((snap.success_rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn throttle_effectiveness_counts_blocked_and_throttled() {
        let metrics = SafeguardMetrics::new();
        for _ in 0..10 {
            metrics.record_creation_attempt();
        }
        metrics.record_creation_throttled();
        metrics.record_creation_throttled();
        metrics.record_creation_blocked();

        let snap = metrics.snapshot();
        assert!((snap.throttle_effectiveness - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn reset_zeroes_everything() {
        let metrics = SafeguardMetrics::new();
        metrics.record_creation_attempt();
        metrics.record_rollback_failure();
        metrics.record_integrity_issues(3);
        metrics.reset();

        let snap = metrics.snapshot();
        assert_eq!(snap.creation_attempts, 0);
        assert_eq!(snap.rollback_failures, 0);
        assert_eq!(snap.integrity_issues_found, 0);
    }
}
