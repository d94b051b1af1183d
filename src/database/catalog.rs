// Catalog queries and DDL
//
// All reads come from pg_catalog / pg_stat views and decode into the typed
// rows in types.rs. Statements that PostgreSQL refuses to run inside a
// transaction (CONCURRENTLY variants, VACUUM) take a dedicated connection,
// never the pool; everything else is generic over the executor so callers
// can route reads through an open transaction.

use sqlx::{PgConnection, PgExecutor};
use tracing::debug;

use crate::error::Result;
use crate::utils::sql::qualified;

use super::types::{
    ActiveStatementRow, BuildProgressRow, IndexUsageRow, IndexValidityRow, InvalidIndexRow,
    OrphanedIndexRow, StaleAdvisoryLockRow, StaleStatisticsRow,
};

/// Does a relation of kind 'r' (ordinary table) exist under this schema?
pub async fn table_exists<'e, E>(executor: E, schema: &str, table: &str) -> Result<bool>
where
    E: PgExecutor<'e>,
{
    let exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE c.relkind IN ('r', 'p') AND c.relname = $1 AND n.nspname = $2
        )
        "#,
    )
    .bind(table)
    .bind(schema)
    .fetch_one(executor)
    .await?;
    Ok(exists)
}

/// Does an index with this name exist under this schema?
pub async fn index_exists<'e, E>(executor: E, schema: &str, index: &str) -> Result<bool>
where
    E: PgExecutor<'e>,
{
    let exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE c.relkind = 'i' AND c.relname = $1 AND n.nspname = $2
        )
        "#,
    )
    .bind(index)
    .bind(schema)
    .fetch_one(executor)
    .await?;
    Ok(exists)
}

/// Validity, readiness and liveness flags for one index. None when the index
/// is not in the catalog at all.
pub async fn index_validity<'e, E>(
    executor: E,
    schema: &str,
    index: &str,
) -> Result<Option<IndexValidityRow>>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query_as::<_, IndexValidityRow>(
        r#"
        SELECT c.relname::text AS index_name,
               i.indisvalid    AS is_valid,
               i.indisready    AS is_ready,
               i.indislive     AS is_live
        FROM pg_index i
        JOIN pg_class c ON c.oid = i.indexrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE c.relname = $1 AND n.nspname = $2
        "#,
    )
    .bind(index)
    .bind(schema)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

/// Drop an index. The concurrent form takes a dedicated autocommit
/// connection; PostgreSQL rejects it inside a transaction.
pub async fn drop_index(
    conn: &mut PgConnection,
    schema: &str,
    index: &str,
    concurrently: bool,
) -> Result<()> {
    let statement = format!(
        "DROP INDEX {}IF EXISTS {}",
        if concurrently { "CONCURRENTLY " } else { "" },
        qualified(schema, index)
    );
    debug!("Executing: {}", statement);
    sqlx::query(&statement).execute(&mut *conn).await?;
    Ok(())
}

/// Whether this server has pg_stat_progress_create_index (PostgreSQL 12+).
/// Degrades to false on any error so progress reporting can fall back.
pub async fn supports_progress_view<'e, E>(executor: E) -> bool
where
    E: PgExecutor<'e>,
{
    let check: Result<Option<bool>> = async {
        let present: Option<bool> = sqlx::query_scalar(
            "SELECT to_regclass('pg_catalog.pg_stat_progress_create_index') IS NOT NULL",
        )
        .fetch_optional(executor)
        .await?;
        Ok(present)
    }
    .await;
    matches!(check, Ok(Some(true)))
}

/// Live progress for a concurrent index build, matched by index or table
/// name. None when no build is visible in the progress view.
pub async fn build_progress<'e, E>(
    executor: E,
    index: &str,
    table: &str,
) -> Result<Option<BuildProgressRow>>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query_as::<_, BuildProgressRow>(
        r#"
        SELECT p.phase::text            AS phase,
               p.tuples_done::bigint    AS tuples_done,
               p.tuples_total::bigint   AS tuples_total
        FROM pg_stat_progress_create_index p
        LEFT JOIN pg_class ic ON ic.oid = p.index_relid
        LEFT JOIN pg_class tc ON tc.oid = p.relid
        WHERE ic.relname = $1 OR tc.relname = $2
        LIMIT 1
        "#,
    )
    .bind(index)
    .bind(table)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

/// Fallback progress source: the raw CREATE INDEX statement in
/// pg_stat_activity, for servers without the progress view.
pub async fn active_build_statement<'e, E>(
    executor: E,
    index: &str,
) -> Result<Option<ActiveStatementRow>>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query_as::<_, ActiveStatementRow>(
        r#"
        SELECT query,
               EXTRACT(EPOCH FROM (now() - query_start))::double precision AS running_seconds
        FROM pg_stat_activity
        WHERE state <> 'idle'
          AND query ILIKE 'CREATE%INDEX%'
          AND query ILIKE '%' || $1 || '%'
          AND pid <> pg_backend_pid()
        LIMIT 1
        "#,
    )
    .bind(index)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

/// Usage statistics for every index in a schema, joined with uniqueness and
/// constraint flags so cleanup can exclude what must never be dropped.
pub async fn index_usage<'e, E>(executor: E, schema: &str) -> Result<Vec<IndexUsageRow>>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, IndexUsageRow>(
        r#"
        SELECT s.schemaname::text        AS schema_name,
               s.relname::text           AS table_name,
               s.indexrelname::text      AS index_name,
               s.idx_scan::bigint        AS index_scans,
               s.idx_tup_read::bigint    AS tuples_read,
               s.idx_tup_fetch::bigint   AS tuples_fetched,
               pg_relation_size(s.indexrelid) AS size_bytes,
               i.indisunique             AS is_unique,
               i.indisprimary            AS is_primary,
               EXISTS (
                   SELECT 1 FROM pg_constraint con WHERE con.conindid = s.indexrelid
               )                         AS supports_constraint
        FROM pg_stat_user_indexes s
        JOIN pg_index i ON i.indexrelid = s.indexrelid
        WHERE s.schemaname = $1
        ORDER BY s.relname, s.indexrelname
        "#,
    )
    .bind(schema)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

/// Indexes left invalid by failed concurrent builds, across all user schemas.
pub async fn invalid_indexes<'e, E>(executor: E) -> Result<Vec<InvalidIndexRow>>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, InvalidIndexRow>(
        r#"
        SELECT n.nspname::text  AS schema_name,
               ic.relname::text AS index_name,
               tc.relname::text AS table_name
        FROM pg_index i
        JOIN pg_class ic ON ic.oid = i.indexrelid
        JOIN pg_class tc ON tc.oid = i.indrelid
        JOIN pg_namespace n ON n.oid = ic.relnamespace
        WHERE NOT i.indisvalid
          AND n.nspname NOT IN ('pg_catalog', 'pg_toast', 'information_schema')
        ORDER BY n.nspname, ic.relname
        "#,
    )
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

/// Index catalog entries whose parent table row is gone. Should always be
/// empty; anything here is catalog damage worth alerting on.
pub async fn orphaned_indexes<'e, E>(executor: E) -> Result<Vec<OrphanedIndexRow>>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, OrphanedIndexRow>(
        r#"
        SELECT n.nspname::text  AS schema_name,
               ic.relname::text AS index_name
        FROM pg_index i
        JOIN pg_class ic ON ic.oid = i.indexrelid
        JOIN pg_namespace n ON n.oid = ic.relnamespace
        LEFT JOIN pg_class tc ON tc.oid = i.indrelid
        WHERE tc.oid IS NULL
        "#,
    )
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

/// Advisory locks whose backing session is no longer in pg_stat_activity.
pub async fn stale_advisory_locks<'e, E>(executor: E) -> Result<Vec<StaleAdvisoryLockRow>>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, StaleAdvisoryLockRow>(
        r#"
        SELECT ((l.classid::bigint << 32) | l.objid::bigint) AS key,
               COALESCE(l.pid, 0) AS pid,
               l.granted          AS granted
        FROM pg_locks l
        LEFT JOIN pg_stat_activity a ON a.pid = l.pid
        WHERE l.locktype = 'advisory'
          AND a.pid IS NULL
        "#,
    )
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

/// Release every advisory lock held by this session. Idempotent.
pub async fn advisory_unlock_all(conn: &mut PgConnection) -> Result<()> {
    sqlx::query("SELECT pg_advisory_unlock_all()")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Tables whose planner statistics are older than `staleness_days` or that
/// have accumulated heavy churn since the last analyze.
pub async fn tables_with_stale_statistics<'e, E>(
    executor: E,
    schema: &str,
    staleness_days: i64,
) -> Result<Vec<StaleStatisticsRow>>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, StaleStatisticsRow>(
        r#"
        SELECT s.schemaname::text AS schema_name,
               s.relname::text    AS table_name,
               COALESCE(s.last_analyze, s.last_autoanalyze) AS last_analyze,
               s.n_mod_since_analyze::bigint AS modifications_since_analyze
        FROM pg_stat_user_tables s
        WHERE s.schemaname = $1
          AND (
               COALESCE(s.last_analyze, s.last_autoanalyze) IS NULL
               OR COALESCE(s.last_analyze, s.last_autoanalyze) < now() - make_interval(days => $2::int)
               OR s.n_mod_since_analyze > 10000
          )
        ORDER BY s.relname
        "#,
    )
    .bind(schema)
    .bind(staleness_days as i32)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

/// Days covered by this database's statistics collector, None when the
/// counters have never been reset (age unknown).
pub async fn statistics_window_days<'e, E>(executor: E) -> Result<Option<f64>>
where
    E: PgExecutor<'e>,
{
    let days: Option<Option<f64>> = sqlx::query_scalar(
        r#"
        SELECT (EXTRACT(EPOCH FROM (now() - stats_reset)) / 86400.0)::double precision
        FROM pg_stat_database
        WHERE datname = current_database()
        "#,
    )
    .fetch_optional(executor)
    .await?;
    Ok(days.flatten())
}

/// Refresh planner statistics for one table. Safe anywhere, including inside
/// a transaction.
pub async fn analyze_table<'e, E>(executor: E, schema: &str, table: &str) -> Result<()>
where
    E: PgExecutor<'e>,
{
    let statement = format!("ANALYZE {}", qualified(schema, table));
    debug!("Executing: {}", statement);
    sqlx::query(&statement).execute(executor).await?;
    Ok(())
}

/// VACUUM ANALYZE one table on a dedicated autocommit connection.
pub async fn vacuum_analyze(conn: &mut PgConnection, schema: &str, table: &str) -> Result<()> {
    let statement = format!("VACUUM (ANALYZE) {}", qualified(schema, table));
    debug!("Executing: {}", statement);
    sqlx::query(&statement).execute(&mut *conn).await?;
    Ok(())
}

/// Rebuild an index without blocking writers. Dedicated connection only.
pub async fn reindex_concurrently(conn: &mut PgConnection, schema: &str, index: &str) -> Result<()> {
    let statement = format!("REINDEX INDEX CONCURRENTLY {}", qualified(schema, index));
    debug!("Executing: {}", statement);
    sqlx::query(&statement).execute(&mut *conn).await?;
    Ok(())
}

/// Blocking rebuild. Takes exclusive locks; only reached through the
/// explicit fallback switch.
pub async fn reindex_blocking(conn: &mut PgConnection, schema: &str, index: &str) -> Result<()> {
    let statement = format!("REINDEX INDEX {}", qualified(schema, index));
    debug!("Executing: {}", statement);
    sqlx::query(&statement).execute(&mut *conn).await?;
    Ok(())
}

/// Apply a session statement_timeout on a dedicated connection.
pub async fn set_statement_timeout(conn: &mut PgConnection, millis: u64) -> Result<()> {
    let statement = format!("SET statement_timeout = {}", millis);
    sqlx::query(&statement).execute(&mut *conn).await?;
    Ok(())
}

/// Numeric server version, e.g. 150004 for 15.4.
pub async fn server_version_num<'e, E>(executor: E) -> Result<i32>
where
    E: PgExecutor<'e>,
{
    let version: i32 = sqlx::query_scalar("SELECT current_setting('server_version_num')::int")
        .fetch_one(executor)
        .await?;
    Ok(version)
}

/// Human-readable server version for the startup banner.
pub async fn server_version<'e, E>(executor: E) -> Result<String>
where
    E: PgExecutor<'e>,
{
    let version: String = sqlx::query_scalar("SHOW server_version")
        .fetch_one(executor)
        .await?;
    Ok(version)
}
