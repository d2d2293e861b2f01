//! Database query functions for the append-only `audit_log` table.
//!
//! Entries are ordered by their ULID primary key, which sorts by creation
//! time, so `ORDER BY id` is the chronological order the API exposes.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::Sqlite;
use sqlx::types::Json;
use sqlx::{Executor, SqlitePool};

use crate::ids;
use crate::models::AuditEntry;

/// Fields supplied by the caller when appending an entry; id and timestamp
/// are allocated here.
#[derive(Debug, Clone)]
pub struct NewAuditEntry<'a> {
    pub task_id: &'a str,
    pub action: &'a str,
    pub actor: Option<&'a str>,
    pub before_state: Option<&'a str>,
    pub after_state: Option<&'a str>,
    pub metadata: Option<serde_json::Value>,
}

/// Append an entry to the audit log and return it.
pub async fn append<'e, E>(ex: E, new: &NewAuditEntry<'_>) -> Result<AuditEntry>
where
    E: Executor<'e, Database = Sqlite>,
{
    let entry = AuditEntry {
        id: ids::new_id(),
        task_id: new.task_id.to_owned(),
        action: new.action.to_owned(),
        actor: new.actor.map(str::to_owned),
        before_state: new.before_state.map(str::to_owned),
        after_state: new.after_state.map(str::to_owned),
        metadata: new.metadata.clone().map(Json),
        created_at: Utc::now(),
    };

    sqlx::query(
        "INSERT INTO audit_log (id, task_id, action, actor, before_state, \
         after_state, metadata, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.id)
    .bind(&entry.task_id)
    .bind(&entry.action)
    .bind(&entry.actor)
    .bind(&entry.before_state)
    .bind(&entry.after_state)
    .bind(&entry.metadata)
    .bind(entry.created_at)
    .execute(ex)
    .await
    .context("failed to append audit entry")?;

    Ok(entry)
}

/// List entries chronologically, optionally scoped to one task.
pub async fn list(
    pool: &SqlitePool,
    task_id: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<AuditEntry>> {
    let entries = sqlx::query_as::<_, AuditEntry>(
        "SELECT * FROM audit_log \
         WHERE (?1 IS NULL OR task_id = ?1) \
         ORDER BY id ASC \
         LIMIT ?2 OFFSET ?3",
    )
    .bind(task_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("failed to list audit entries")?;

    Ok(entries)
}

/// The full chronological history of a single task.
pub async fn task_history(pool: &SqlitePool, task_id: &str) -> Result<Vec<AuditEntry>> {
    let entries = sqlx::query_as::<_, AuditEntry>(
        "SELECT * FROM audit_log WHERE task_id = ? ORDER BY id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch task history")?;

    Ok(entries)
}
