/// curator-ops: Operator CLI for the Curator index lifecycle engine
///
/// Connects to the target database, runs one operation, and prints the
/// result as human-readable lines or JSON. No background tasks are spawned;
/// every command is a single foreground pass.
///
/// Commands:
/// - status: throttle, locks, builds, operations, lifecycle, metrics
/// - create: build one index concurrently through the full safeguard chain
/// - cleanup: drop (or list) unused indexes
/// - reindex: rebuild (or list) bloated indexes
/// - maintenance: run due cadences now
/// - integrity: sweep for invalid indexes, orphans, stale locks
/// - progress: report one build's progress
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;

use curator::config::EngineConfig;
use curator::engine::{CreationOptions, CuratorEngine};
use curator::executor::MutationRequest;

#[derive(Parser)]
#[command(name = "curator-ops")]
#[command(about = "Operator CLI for the Curator index lifecycle engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database URL override
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Emit JSON instead of human-readable output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show engine status: throttle, locks, builds, lifecycle, metrics
    Status,

    /// Create one index concurrently
    Create {
        /// Target table, optionally schema-qualified
        #[arg(short, long)]
        table: String,

        /// Column or expression the index covers
        #[arg(short, long)]
        field: String,

        /// Name for the new index
        #[arg(short, long)]
        index_name: String,

        /// CREATE INDEX statement; rewritten to the concurrent form
        #[arg(short, long)]
        sql: String,

        /// Skip the CPU/pacing gate
        #[arg(long)]
        no_throttle: bool,

        /// statement_timeout override in seconds
        #[arg(long)]
        timeout_seconds: Option<u64>,
    },

    /// Drop unused indexes (dry-run unless --live)
    Cleanup {
        /// Candidates need fewer lifetime scans than this
        #[arg(long)]
        min_scans: Option<i64>,

        /// Statistics window must cover at least this many days
        #[arg(long)]
        days_unused: Option<i64>,

        /// Actually drop; default is report-only
        #[arg(long)]
        live: bool,
    },

    /// Rebuild bloated indexes (dry-run unless --live)
    Reindex {
        /// Estimated bloat percentage that marks an index for rebuild
        #[arg(long)]
        bloat_threshold: Option<f64>,

        /// Ignore indexes smaller than this many megabytes
        #[arg(long)]
        min_size_mb: Option<i64>,

        /// Actually rebuild; default is report-only
        #[arg(long)]
        live: bool,
    },

    /// Run every due maintenance cadence
    Maintenance {
        /// Run both cadences regardless of schedule
        #[arg(long)]
        force: bool,
    },

    /// Sweep for invalid indexes, orphaned entries and stale advisory locks
    Integrity {
        /// Clean up what the sweep finds
        #[arg(long)]
        remediate: bool,
    },

    /// Report progress for one index build
    Progress {
        /// Index name to look up
        index: String,
    },
}

#[derive(Serialize)]
struct StatusReport {
    enabled: bool,
    throttle: curator::throttle::ThrottleStatus,
    active_locks: Vec<curator::locks::ActiveLockInfo>,
    active_builds: Vec<curator::progress::ActiveBuildInfo>,
    active_operations: Vec<curator::resilience::ActiveOperation>,
    lifecycle: curator::lifecycle::LifecycleStatus,
    metrics: curator::metrics::MetricsSnapshot,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(url) = &cli.database_url {
        config.database.url = url.clone();
    }

    let engine = CuratorEngine::connect(config).await?;

    match cli.command {
        Commands::Status => status(&engine, cli.json),
        Commands::Create {
            table,
            field,
            index_name,
            sql,
            no_throttle,
            timeout_seconds,
        } => {
            create(
                &engine,
                MutationRequest {
                    table,
                    field,
                    index_name,
                    index_sql: sql,
                    priority: Default::default(),
                },
                no_throttle,
                timeout_seconds,
                cli.json,
            )
            .await
        }
        Commands::Cleanup {
            min_scans,
            days_unused,
            live,
        } => cleanup(&engine, min_scans, days_unused, live, cli.json).await,
        Commands::Reindex {
            bloat_threshold,
            min_size_mb,
            live,
        } => reindex(&engine, bloat_threshold, min_size_mb, live, cli.json).await,
        Commands::Maintenance { force } => maintenance(&engine, force, cli.json).await,
        Commands::Integrity { remediate } => integrity(&engine, remediate, cli.json).await,
        Commands::Progress { index } => progress(&engine, &index, cli.json).await,
    }
}

/// Log to stderr only so stdout stays clean for command output.
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("curator=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn status(engine: &CuratorEngine, json: bool) -> Result<()> {
    let report = StatusReport {
        enabled: engine.is_enabled(),
        throttle: engine.throttle_status(),
        active_locks: engine.active_locks(),
        active_builds: engine.active_builds(),
        active_operations: engine.active_operations(),
        lifecycle: engine.lifecycle_status(),
        metrics: engine.metrics_snapshot(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "Engine:     {}",
        if report.enabled { "enabled" } else { "DISABLED" }
    );
    println!(
        "CPU:        {:.1}% now, {:.1}% avg (threshold {:.1}%)",
        report.throttle.current_cpu_percent,
        report.throttle.average_cpu_percent,
        report.throttle.cpu_threshold_percent
    );
    match &report.throttle.reason {
        Some(reason) => println!(
            "Throttled:  yes, {} (retry in {}s)",
            reason, report.throttle.wait_seconds
        ),
        None => println!("Throttled:  no"),
    }
    println!("Locks held: {}", report.active_locks.len());
    for lock in &report.active_locks {
        println!(
            "  {} on '{}' for {}s",
            lock.kind, lock.resource, lock.held_seconds
        );
    }
    println!("Builds:     {}", report.active_builds.len());
    for build in &report.active_builds {
        println!(
            "  '{}' on '{}' running {}s",
            build.index_name, build.table_name, build.running_seconds
        );
    }
    println!("Operations: {}", report.active_operations.len());
    println!(
        "Lifecycle:  {} (pending vacuum: {})",
        if report.lifecycle.enabled { "enabled" } else { "disabled" },
        report.lifecycle.pending_vacuum_tables
    );
    println!(
        "Creations:  {} attempted, {} succeeded, {} failed, {} throttled, {} blocked",
        report.metrics.creation_attempts,
        report.metrics.creation_successes,
        report.metrics.creation_failures,
        report.metrics.creation_throttled,
        report.metrics.creation_blocked
    );
    Ok(())
}

async fn create(
    engine: &CuratorEngine,
    request: MutationRequest,
    no_throttle: bool,
    timeout_seconds: Option<u64>,
    json: bool,
) -> Result<()> {
    let options = CreationOptions {
        respect_cpu_throttle: !no_throttle,
        statement_timeout: timeout_seconds.map(Duration::from_secs),
    };
    let report = engine.request_index_creation(request, &options).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.created {
        println!(
            "Created '{}' on '{}' in {:.1}s{}",
            report.index_name,
            report.table_name,
            report.elapsed_seconds,
            if report.cpu_ceiling_breached {
                " (CPU ceiling was breached during the build)"
            } else {
                ""
            }
        );
    } else {
        println!(
            "Index '{}' already exists and is healthy; nothing to do",
            report.index_name
        );
    }
    Ok(())
}

async fn cleanup(
    engine: &CuratorEngine,
    min_scans: Option<i64>,
    days_unused: Option<i64>,
    live: bool,
    json: bool,
) -> Result<()> {
    let defaults = &engine.config().lifecycle.cleanup;
    let min_scans = min_scans.unwrap_or(defaults.min_scans);
    let days_unused = days_unused.unwrap_or(defaults.days_unused);

    let removed = engine
        .request_index_cleanup(min_scans, days_unused, !live)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&removed)?);
        return Ok(());
    }
    if removed.is_empty() {
        println!("No unused indexes found");
        return Ok(());
    }
    for index in &removed {
        println!(
            "{} '{}.{}' on '{}' ({} scans, {} bytes)",
            if index.removed { "Dropped" } else { "Would drop" },
            index.schema_name,
            index.index_name,
            index.table_name,
            index.index_scans,
            index.size_bytes
        );
    }
    Ok(())
}

async fn reindex(
    engine: &CuratorEngine,
    bloat_threshold: Option<f64>,
    min_size_mb: Option<i64>,
    live: bool,
    json: bool,
) -> Result<()> {
    let defaults = &engine.config().lifecycle.reindex;
    let threshold = bloat_threshold.unwrap_or(defaults.bloat_threshold_percent);
    let min_size = min_size_mb.unwrap_or(defaults.min_size_mb);

    let rebuilt = engine.request_reindex(threshold, min_size, !live).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rebuilt)?);
        return Ok(());
    }
    if rebuilt.is_empty() {
        println!("No bloated indexes found");
        return Ok(());
    }
    for index in &rebuilt {
        println!(
            "{:?} '{}.{}' (~{:.0}% bloat, {} bytes)",
            index.mode, index.schema_name, index.index_name,
            index.estimated_bloat_percent, index.size_bytes
        );
    }
    Ok(())
}

async fn maintenance(engine: &CuratorEngine, force: bool, json: bool) -> Result<()> {
    let report = engine.run_maintenance_pass(force).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if !report.did_anything() {
        println!("No maintenance cadence was due (use --force to run anyway)");
        return Ok(());
    }
    println!("Cadences run: {}", report.cadences_run.join(", "));
    println!("  Removed indexes:  {}", report.removed_indexes.len());
    println!("  Rebuilt indexes:  {}", report.reindexed_indexes.len());
    println!("  Analyzed tables:  {}", report.analyzed_tables.len());
    println!("  Vacuumed tables:  {}", report.vacuumed_tables.len());
    for error in &report.errors {
        println!("  Step '{}' failed: {}", error.step, error.detail);
    }
    Ok(())
}

async fn integrity(engine: &CuratorEngine, remediate: bool, json: bool) -> Result<()> {
    let (report, remediation) = engine.check_integrity(remediate).await?;

    if json {
        #[derive(Serialize)]
        struct IntegrityOutput {
            report: curator::resilience::IntegrityReport,
            remediation: Option<curator::resilience::IntegrityRemediation>,
        }
        println!(
            "{}",
            serde_json::to_string_pretty(&IntegrityOutput { report, remediation })?
        );
        return Ok(());
    }

    if report.is_clean() {
        println!("Integrity check clean");
        return Ok(());
    }
    println!("Integrity issues: {}", report.summary());
    for index in &report.invalid_indexes {
        println!("  invalid index '{}.{}'", index.schema_name, index.index_name);
    }
    for index in &report.orphaned_indexes {
        println!("  orphaned entry '{}.{}'", index.schema_name, index.index_name);
    }
    for lock in &report.stale_advisory_locks {
        println!("  stale advisory lock key {}", lock.key);
    }
    for op in &report.stuck_operations {
        println!("  stuck operation '{}' on '{}'", op.name, op.resource);
    }
    if let Some(fixes) = remediation {
        println!(
            "Remediation: {} invalid dropped, {} orphans dropped, {} operations cleared{}",
            fixes.invalid_dropped,
            fixes.orphans_dropped,
            fixes.operations_cleared,
            if fixes.own_session_locks_released {
                ", own-session advisory locks released"
            } else {
                ""
            }
        );
    }
    Ok(())
}

async fn progress(engine: &CuratorEngine, index: &str, json: bool) -> Result<()> {
    let progress = engine.build_progress(index).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&progress)?);
        return Ok(());
    }
    match progress {
        curator::progress::BuildProgress::Complete => {
            println!("Index '{}' is built, valid and live", index)
        }
        curator::progress::BuildProgress::InProgress {
            phase,
            tuples_done,
            tuples_total,
        } => {
            let percent = if tuples_total > 0 {
                format!(" ({:.1}%)", tuples_done as f64 / tuples_total as f64 * 100.0)
            } else {
                String::new()
            };
            println!("Building '{}': phase {}{}", index, phase, percent)
        }
        curator::progress::BuildProgress::ActiveStatement {
            query,
            running_seconds,
        } => {
            let elapsed = running_seconds
                .map(|s| format!(" for {}s", s))
                .unwrap_or_default();
            println!("Build statement running{}: {}", elapsed, query)
        }
        curator::progress::BuildProgress::Unknown => {
            println!("No build activity visible for '{}'", index)
        }
    }
    Ok(())
}
