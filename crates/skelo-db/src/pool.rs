use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::config::DbConfig;

/// Embedded schema, applied idempotently at pool creation.
///
/// Column names are load-bearing: they match the persisted-state layout and
/// must not be renamed without a migration.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id                  TEXT PRIMARY KEY,
    type                TEXT NOT NULL,
    status              TEXT NOT NULL DEFAULT 'PENDING',
    priority            INTEGER NOT NULL DEFAULT 0,
    manual_rank         REAL,
    summary             TEXT NOT NULL,
    prompt              TEXT NOT NULL,
    acceptance_criteria TEXT NOT NULL DEFAULT '[]',
    definition_of_done  TEXT NOT NULL DEFAULT '[]',
    backend             TEXT NOT NULL,
    backend_config      TEXT,
    result              TEXT,
    lease_owner         TEXT,
    lease_expires_at    TEXT,
    attempt_count       INTEGER NOT NULL DEFAULT 0,
    bounce_count        INTEGER NOT NULL DEFAULT 0,
    max_attempts        INTEGER NOT NULL DEFAULT 5,
    max_bounces         INTEGER NOT NULL DEFAULT 3,
    last_error          TEXT,
    feedback_history    TEXT NOT NULL DEFAULT '[]',
    depends_on          TEXT NOT NULL DEFAULT '[]',
    pipeline_id         TEXT,
    pipeline_step       INTEGER,
    gates               TEXT NOT NULL DEFAULT '[]',
    metadata            TEXT NOT NULL DEFAULT '{}',
    auto_review         TEXT,
    parent_task_id      TEXT,
    loop_iteration      INTEGER NOT NULL DEFAULT 0,
    held_by             TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_pending_order
    ON tasks(status, priority ASC, manual_rank ASC, created_at ASC, id ASC)
    WHERE status = 'PENDING';

CREATE INDEX IF NOT EXISTS idx_tasks_lease_expiry
    ON tasks(lease_expires_at)
    WHERE lease_owner IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_tasks_pipeline
    ON tasks(pipeline_id, pipeline_step)
    WHERE pipeline_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS audit_log (
    id           TEXT PRIMARY KEY,
    task_id      TEXT NOT NULL,
    action       TEXT NOT NULL,
    actor        TEXT,
    before_state TEXT,
    after_state  TEXT,
    metadata     TEXT,
    created_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_task_time
    ON audit_log(task_id, created_at);

CREATE TABLE IF NOT EXISTS templates (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL UNIQUE,
    description   TEXT,
    template_type TEXT NOT NULL,
    definition    TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
"#;

/// Open (creating if necessary) the database file and apply the schema.
///
/// WAL mode keeps the three schedulers (dispatcher, watchdog, HTTP server)
/// from blocking each other on reads while a write transaction is open.
pub async fn create_pool(config: &DbConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(&config.db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .with_context(|| {
            format!("failed to open database at {}", config.db_path.display())
        })?;

    init_schema(&pool).await?;
    Ok(pool)
}

/// Apply the embedded schema. Idempotent.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .context("failed to apply database schema")?;
    info!("database schema applied");
    Ok(())
}

/// Return the row count for each table. Useful for the `skelo db-init`
/// success message.
pub async fn table_counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let mut counts = Vec::new();
    for table in ["tasks", "audit_log", "templates"] {
        let query = format!("SELECT COUNT(*) FROM {table}");
        let count: (i64,) = sqlx::query_as(&query)
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to count rows in {table}"))?;
        counts.push((table.to_owned(), count.0));
    }
    Ok(counts)
}
