/// SQLite pool bootstrap and schema
///
/// One database file holds every table. WAL mode lets workers read while a
/// single writer holds the lock; the busy timeout makes competing writers wait
/// instead of failing.

use crate::config::DatabaseConfig;
use crate::error::SchedulerResult;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the configured database, creating the file when missing
pub async fn connect(config: &DatabaseConfig) -> SchedulerResult<SqlitePool> {
    tracing::info!("🗄️ Opening scheduler database: {}", config.url);

    let options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await?;

    init_schema(&pool).await?;

    tracing::info!("✅ Scheduler database ready");
    Ok(pool)
}

/// Create tables and indexes
///
/// Safe to call multiple times (uses IF NOT EXISTS).
pub async fn init_schema(pool: &SqlitePool) -> SchedulerResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            node_id TEXT PRIMARY KEY,
            operation_name TEXT,
            desired_state TEXT NOT NULL,
            desired_spec TEXT NOT NULL,
            generation INTEGER NOT NULL DEFAULT 0,
            active_run_id TEXT,
            created_at INTEGER NOT NULL,
            modified_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT PRIMARY KEY,
            node_id TEXT NOT NULL REFERENCES nodes(node_id),
            operation_name TEXT,
            generation INTEGER NOT NULL,
            kind TEXT NOT NULL,
            state TEXT NOT NULL,
            cancel_requested_at INTEGER,
            created_at INTEGER NOT NULL,
            finished_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // run_id is not a foreign key: steps can be materialised for a run id
    // before (or without) its runs row
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS step_executions (
            step_id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            operation_name TEXT NOT NULL,
            step_type TEXT NOT NULL,
            is_reverting INTEGER NOT NULL,
            state TEXT NOT NULL,
            attempt INTEGER NOT NULL DEFAULT 0,
            available_attempts INTEGER NOT NULL,
            worker_id TEXT,
            claimed_at INTEGER,
            heartbeat_at INTEGER,
            ready_at INTEGER,
            finished_at INTEGER,
            deferred_task_uid TEXT,
            payload TEXT,
            error_traceback TEXT,
            requires_manual_intervention INTEGER NOT NULL DEFAULT 0,
            manual_action TEXT,
            manual_action_by TEXT,
            manual_action_reason TEXT,
            manual_action_at INTEGER,
            created_at INTEGER NOT NULL,
            modified_at INTEGER NOT NULL,
            UNIQUE (run_id, step_type, is_reverting)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_step_executions_claim ON step_executions(state, ready_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_step_executions_run ON step_executions(run_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS step_deps (
            run_id TEXT NOT NULL,
            step_id TEXT NOT NULL REFERENCES step_executions(step_id),
            depends_on_step_id TEXT NOT NULL REFERENCES step_executions(step_id),
            PRIMARY KEY (step_id, depends_on_step_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS step_fail_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            step_id TEXT NOT NULL REFERENCES step_executions(step_id),
            attempt INTEGER NOT NULL,
            state TEXT NOT NULL,
            message TEXT,
            finished_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Single-connection in-memory pool with the schema applied
#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    init_schema(&pool).await.unwrap();
    pool
}
