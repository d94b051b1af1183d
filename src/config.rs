// Engine configuration
//
// Loaded from a TOML file with every section optional; missing values fall
// back to conservative defaults so a bare `[database]` url is enough to run.
// A handful of environment variables override the file for container deploys.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CuratorError, Result};

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub throttle: ThrottleConfig,
    pub locks: LockConfig,
    pub operations: OperationConfig,
    pub builds: BuildConfig,
    pub integrity: IntegrityConfig,
    pub lifecycle: LifecycleConfig,
}

/// Connection settings for the control-plane pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection URL. Overridden by CURATOR_DATABASE_URL / DATABASE_URL.
    pub url: String,

    /// application_name reported to the server for every session
    pub application_name: String,

    /// Pool size for catalog reads and transactional bookkeeping
    pub max_connections: u32,

    /// How long to wait for a pooled connection before giving up
    pub acquire_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/postgres".to_string(),
            application_name: "curator".to_string(),
            max_connections: (num_cpus::get() as u32).clamp(2, 8),
            acquire_timeout_seconds: 30,
        }
    }
}

/// CPU throttle governor thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Mutations are declined while instantaneous or windowed CPU exceeds this
    pub cpu_threshold_percent: f64,

    /// Breaching this during a build emits a warning but never kills the build
    pub hard_ceiling_percent: f64,

    /// Pacing floor between schema mutations
    pub min_seconds_between_mutations: u64,

    /// Suggested wait when declining for CPU pressure
    pub cooldown_seconds: u64,

    /// Width of the rolling CPU sample window
    pub window_seconds: u64,

    /// Background sampling cadence
    pub sample_interval_seconds: u64,

    /// Re-check cadence inside wait_for_cooldown
    pub cooldown_poll_seconds: u64,

    /// Upper bound on how long background work waits for CPU to settle
    pub max_cooldown_wait_seconds: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            cpu_threshold_percent: 80.0,
            hard_ceiling_percent: 95.0,
            min_seconds_between_mutations: 300, // 5 minutes
            cooldown_seconds: 60,
            window_seconds: 60,
            sample_interval_seconds: 5,
            cooldown_poll_seconds: 5,
            max_cooldown_wait_seconds: 600,
        }
    }
}

/// In-process resource lock settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Default lease on a resource lock; stale sweep reclaims at 2x this
    pub default_timeout_seconds: u64,

    /// How often the background sweep looks for abandoned locks
    pub sweep_interval_seconds: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 300,
            sweep_interval_seconds: 60,
        }
    }
}

/// Safe-operation scope settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationConfig {
    /// Operations registered longer than this are flagged as stuck
    pub max_duration_seconds: u64,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            max_duration_seconds: 3600, // 1 hour
        }
    }
}

/// Concurrent index build settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// A build still running past this is reported as hanging
    pub hang_threshold_seconds: u64,

    /// Progress poll cadence for in-flight builds
    pub poll_interval_seconds: u64,

    /// statement_timeout applied to the build session
    pub statement_timeout_seconds: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            hang_threshold_seconds: 3600,
            poll_interval_seconds: 30,
            statement_timeout_seconds: 3600,
        }
    }
}

/// Periodic integrity sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    pub sweep_interval_seconds: u64,

    /// When false the sweep only reports; cleanup routines never run
    pub remediate: bool,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: 900, // 15 minutes
            remediate: true,
        }
    }
}

/// Scheduled maintenance cadences and their sub-task knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub enabled: bool,

    /// Schemas under management
    pub tenants: Vec<String>,

    /// How often the scheduler checks whether a cadence is due
    pub check_interval_seconds: u64,

    pub weekly_interval_days: i64,
    pub monthly_interval_days: i64,

    pub cleanup: CleanupConfig,
    pub reindex: ReindexConfig,
    pub statistics: StatisticsConfig,
    pub vacuum: VacuumConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tenants: vec!["public".to_string()],
            check_interval_seconds: 3600,
            weekly_interval_days: 7,
            monthly_interval_days: 30,
            cleanup: CleanupConfig::default(),
            reindex: ReindexConfig::default(),
            statistics: StatisticsConfig::default(),
            vacuum: VacuumConfig::default(),
        }
    }
}

/// Unused-index cleanup thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,

    /// Indexes with fewer lifetime scans than this are candidates
    pub min_scans: i64,

    /// Only considered once the statistics window covers this many days
    pub days_unused: i64,

    /// Report candidates without dropping them
    pub dry_run: bool,

    /// When set, only indexes with this name prefix are ever dropped
    pub managed_prefix: Option<String>,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_scans: 10,
            days_unused: 7,
            dry_run: true,
            managed_prefix: None,
        }
    }
}

/// Bloated-index rebuild thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReindexConfig {
    pub enabled: bool,

    /// Estimated bloat percentage that marks an index for rebuild
    pub bloat_threshold_percent: f64,

    /// Ignore indexes smaller than this; bloat estimates are noise below it
    pub min_size_mb: i64,

    pub dry_run: bool,

    /// Permit a blocking REINDEX when the concurrent form is unavailable.
    /// Off by default; blocking rebuilds take exclusive table locks.
    pub allow_blocking_fallback: bool,
}

impl Default for ReindexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bloat_threshold_percent: 30.0,
            min_size_mb: 10,
            dry_run: true,
            allow_blocking_fallback: false,
        }
    }
}

/// Planner statistics refresh thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    pub enabled: bool,

    /// Tables not analyzed within this many days get an ANALYZE
    pub staleness_days: i64,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            staleness_days: 7,
        }
    }
}

/// Monthly vacuum settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VacuumConfig {
    pub enabled: bool,

    /// Cap on tables vacuumed per pass
    pub max_tables_per_pass: usize,
}

impl Default for VacuumConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_tables_per_pass: 25,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist. Environment overrides apply in both cases.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let content = fs::read_to_string(p)?;
                let parsed: EngineConfig = toml::from_str(&content)
                    .map_err(|e| CuratorError::Config(format!("failed to parse {}: {}", p.display(), e)))?;
                debug!("Loaded configuration from: {}", p.display());
                parsed
            }
            Some(p) => {
                warn!("Configuration file {} not found, using defaults", p.display());
                EngineConfig::default()
            }
            None => EngineConfig::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (used by tests and embedders).
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| CuratorError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the effective configuration, e.g. for `--print-config`.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| CuratorError::Config(format!("failed to serialize config: {}", e)))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("CURATOR_DATABASE_URL") {
            self.database.url = url;
        } else if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(raw) = std::env::var("CURATOR_CPU_THRESHOLD") {
            match raw.parse::<f64>() {
                Ok(v) => self.throttle.cpu_threshold_percent = v,
                Err(_) => warn!("Ignoring non-numeric CURATOR_CPU_THRESHOLD: {}", raw),
            }
        }
        if let Ok(raw) = std::env::var("CURATOR_DRY_RUN") {
            let on = matches!(raw.as_str(), "1" | "true" | "yes");
            self.lifecycle.cleanup.dry_run = on;
            self.lifecycle.reindex.dry_run = on;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(CuratorError::Config("database.url must not be empty".into()));
        }
        if self.throttle.cpu_threshold_percent <= 0.0 || self.throttle.cpu_threshold_percent > 100.0 {
            return Err(CuratorError::Config(
                "throttle.cpu_threshold_percent must be in (0, 100]".into(),
            ));
        }
        if self.throttle.hard_ceiling_percent < self.throttle.cpu_threshold_percent {
            return Err(CuratorError::Config(
                "throttle.hard_ceiling_percent must be >= cpu_threshold_percent".into(),
            ));
        }
        if self.lifecycle.tenants.is_empty() {
            return Err(CuratorError::Config("lifecycle.tenants must not be empty".into()));
        }
        for tenant in &self.lifecycle.tenants {
            if !crate::utils::sql::is_valid_identifier(tenant) {
                return Err(CuratorError::Config(format!(
                    "lifecycle.tenants entry '{}' is not a valid schema name",
                    tenant
                )));
            }
        }
        Ok(())
    }
}

impl ThrottleConfig {
    pub fn min_between_mutations(&self) -> Duration {
        Duration::from_secs(self.min_seconds_between_mutations)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_seconds)
    }

    pub fn cooldown_poll(&self) -> Duration {
        Duration::from_secs(self.cooldown_poll_seconds)
    }

    pub fn max_cooldown_wait(&self) -> Duration {
        Duration::from_secs(self.max_cooldown_wait_seconds)
    }
}

impl LockConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }
}

impl BuildConfig {
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_seconds)
    }
}
