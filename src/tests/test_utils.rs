// src/tests/test_utils.rs
//! Shared scaffolding for the test suites: a scriptable CPU probe, small
//! config builders, offline database handles, and the live-server gate.

use std::sync::{Arc, Mutex};

use crate::config::{DatabaseConfig, ThrottleConfig};
use crate::database::{Database, IndexUsageRow};
use crate::metrics::SafeguardMetrics;
use crate::throttle::CpuProbe;

/// CPU probe that reports whatever the test last set. The lever half is
/// cloneable so tests can change the reading while the governor owns the probe.
pub struct FakeCpuProbe {
    value: Arc<Mutex<f64>>,
}

#[derive(Clone)]
pub struct CpuLever {
    value: Arc<Mutex<f64>>,
}

impl FakeCpuProbe {
    /// Probe pinned at `percent` plus the lever that adjusts it later.
    pub fn at(percent: f64) -> (Self, CpuLever) {
        let value = Arc::new(Mutex::new(percent));
        (
            Self {
                value: Arc::clone(&value),
            },
            CpuLever { value },
        )
    }
}

impl CpuLever {
    pub fn set(&self, percent: f64) {
        *self.value.lock().unwrap() = percent;
    }
}

impl CpuProbe for FakeCpuProbe {
    fn sample(&mut self) -> f64 {
        *self.value.lock().unwrap()
    }
}

/// Throttle config with second-scale knobs so tests finish quickly. Pacing is
/// off by default; tests that exercise it set `min_seconds_between_mutations`.
pub fn fast_throttle_config() -> ThrottleConfig {
    ThrottleConfig {
        cpu_threshold_percent: 80.0,
        hard_ceiling_percent: 95.0,
        min_seconds_between_mutations: 0,
        cooldown_seconds: 1,
        window_seconds: 60,
        sample_interval_seconds: 1,
        cooldown_poll_seconds: 1,
        max_cooldown_wait_seconds: 1,
    }
}

pub fn test_metrics() -> Arc<SafeguardMetrics> {
    Arc::new(SafeguardMetrics::new())
}

/// Database handle that never connects. Good enough for components whose
/// tested paths stay in memory (build tracking, registries).
pub fn offline_database() -> Arc<Database> {
    let config = DatabaseConfig {
        url: "postgres://localhost:5432/curator_offline".to_string(),
        application_name: "curator-test".to_string(),
        max_connections: 1,
        acquire_timeout_seconds: 1,
    };
    let db = Database::connect_lazy(&config)
        .expect("offline database handle should always construct");
    Arc::new(db)
}

/// Index usage row with plain-index defaults; tests override the flags they
/// care about.
pub fn usage_row(schema: &str, table: &str, index: &str, scans: i64) -> IndexUsageRow {
    IndexUsageRow {
        schema_name: schema.to_string(),
        table_name: table.to_string(),
        index_name: index.to_string(),
        index_scans: scans,
        tuples_read: scans * 10,
        tuples_fetched: scans * 8,
        size_bytes: 8 * 1024 * 1024,
        is_unique: false,
        is_primary: false,
        supports_constraint: false,
    }
}

/// URL of the live test server, when one is available.
///
/// Integration tests call this and return early (with a note) when unset, so
/// the suite passes without a PostgreSQL instance.
pub fn live_database_url() -> Option<String> {
    std::env::var("CURATOR_TEST_DATABASE_URL").ok()
}

/// Connect to the live test server, or None when the gate is unset.
pub async fn live_database() -> anyhow::Result<Option<Arc<Database>>> {
    let Some(url) = live_database_url() else {
        return Ok(None);
    };
    let config = DatabaseConfig {
        url,
        application_name: "curator-test".to_string(),
        max_connections: 4,
        acquire_timeout_seconds: 10,
    };
    let db = Database::connect(&config).await?;
    Ok(Some(Arc::new(db)))
}
