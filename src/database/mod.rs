//! Curator's Database Module - PostgreSQL Control Plane
//!
//! One pool for catalog reads and transactional bookkeeping, plus dedicated
//! autocommit connections for the statements PostgreSQL refuses inside a
//! transaction (CREATE INDEX CONCURRENTLY, REINDEX CONCURRENTLY, VACUUM,
//! DROP INDEX CONCURRENTLY).

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, PgConnection, PgPool};
use tracing::{debug, info};

pub mod catalog;
pub mod types;

pub use types::*;

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::utils::redact::redact_url;

/// The engine's handle on PostgreSQL.
pub struct Database {
    pool: PgPool,
    connect_options: PgConnectOptions,
    redacted_url: String,
}

impl Database {
    /// Connect the pool and stash connect options for later dedicated
    /// connections.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let redacted_url = redact_url(&config.url);
        info!("🐘 Connecting to PostgreSQL at {}", redacted_url);

        let connect_options = PgConnectOptions::from_str(&config.url)?
            .application_name(&config.application_name);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect_with(connect_options.clone())
            .await?;

        info!(
            "Connection pool ready ({} max connections)",
            config.max_connections
        );

        Ok(Self {
            pool,
            connect_options,
            redacted_url,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Open a dedicated autocommit connection outside the pool. The caller
    /// owns it and should `close()` it when done; session state (advisory
    /// locks, statement_timeout) never leaks back into the pool.
    pub async fn dedicated_connection(&self) -> Result<PgConnection> {
        debug!("Opening dedicated autocommit connection");
        let conn = self.connect_options.connect().await?;
        Ok(conn)
    }

    /// Cheap liveness check for health reporting.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Connection target with credentials masked, safe for logs.
    pub fn redacted_url(&self) -> &str {
        &self.redacted_url
    }

    /// Close the pool gracefully on shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
        debug!("Connection pool closed");
    }

    /// Build a handle without connecting. Test scaffolding for components
    /// that hold a Database but are exercised without touching the server.
    #[cfg(test)]
    pub(crate) fn connect_lazy(config: &DatabaseConfig) -> Result<Self> {
        let connect_options = PgConnectOptions::from_str(&config.url)?
            .application_name(&config.application_name);
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_lazy_with(connect_options.clone());
        Ok(Self {
            pool,
            connect_options,
            redacted_url: redact_url(&config.url),
        })
    }
}
