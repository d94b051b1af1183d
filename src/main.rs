#!/usr/bin/env cargo run --release

// Use modules from the library crate
// (imports are done directly where needed)

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use curator::config::EngineConfig;
use curator::database::catalog;
use curator::engine::CuratorEngine;

#[derive(Parser)]
#[command(
    name = "curator-server",
    version,
    about = "Autonomous PostgreSQL index lifecycle engine"
)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Database URL override (beats the config file and environment)
    #[arg(long)]
    database_url: Option<String>,

    /// Directory for rolling log files
    #[arg(long, default_value = ".curator/logs")]
    log_dir: String,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging with both console and file output
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("curator=info"))
        .unwrap();

    let logs_dir = shellexpand::tilde(&args.log_dir).to_string();
    fs::create_dir_all(&logs_dir).unwrap_or_else(|e| {
        eprintln!("Failed to create logs directory: {}", e);
    });

    // Set up file appender with daily rolling
    let file_appender = rolling::daily(&logs_dir, "curator.log");
    let (non_blocking_file, _file_guard) = non_blocking(file_appender);

    // Set up console appender
    let (non_blocking_console, _console_guard) = non_blocking(std::io::stdout());

    // Create multi-layer subscriber
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking_console)
                .with_target(false)
                .with_ansi(true),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking_file)
                .with_target(true)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true),
        )
        .init();

    info!("🚀 Starting Curator - Autonomous PostgreSQL Index Lifecycle Engine");
    info!(
        "📝 Logging enabled - Console output + File output to {}/curator.log",
        logs_dir
    );

    let config_path = args
        .config
        .map(|p| PathBuf::from(shellexpand::tilde(&p).to_string()));
    let mut config = EngineConfig::load(config_path.as_deref())?;
    if let Some(url) = args.database_url {
        config.database.url = url;
    }

    if args.print_config {
        println!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let engine = Arc::new(CuratorEngine::connect(config).await?);

    engine.database().ping().await?;
    match catalog::server_version(engine.database().pool()).await {
        Ok(version) => info!("📋 PostgreSQL server version: {}", version),
        Err(e) => warn!("Could not read server version: {}", e),
    }

    // Startup integrity check with a timeout so a slow catalog never blocks
    // the engine from coming up
    info!("🔍 Running startup integrity check...");
    let sweep_start = std::time::Instant::now();
    let remediate = engine.config().integrity.remediate;
    match tokio::time::timeout(
        std::time::Duration::from_secs(30),
        engine.check_integrity(remediate),
    )
    .await
    {
        Ok(Ok((report, remediation))) => {
            let duration = sweep_start.elapsed();
            if report.is_clean() {
                info!(
                    "✅ Startup integrity check clean in {:.2}s",
                    duration.as_secs_f64()
                );
            } else {
                warn!(
                    "⚠️ Startup integrity check found {} issues in {:.2}s{}",
                    report.issue_count(),
                    duration.as_secs_f64(),
                    if remediation.is_some() {
                        " (remediation applied)"
                    } else {
                        ""
                    }
                );
            }
        }
        Ok(Err(e)) => {
            warn!("⚠️ Startup integrity check failed: {} (engine will continue)", e);
        }
        Err(_) => {
            warn!("⏰ Startup integrity check timed out after 30s (engine will continue)");
        }
    }

    let tasks = Arc::clone(&engine).start_background_tasks();
    debug!("✓ {} background tasks running", tasks.task_count());
    info!("🎯 Curator is up; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("👋 Shutdown signal received");

    tasks.shutdown();
    engine.close().await;
    info!("🏁 Curator stopped");
    Ok(())
}
