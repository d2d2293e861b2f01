//! Database query functions for the `tasks` table.
//!
//! These are row-level operations: callers construct fully-formed [`Task`]
//! values and this module reads and writes them. Validation, transition
//! rules, and audit logging live in `skelo-core`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::Sqlite;
use sqlx::types::Json;
use sqlx::{Executor, SqlitePool};

use crate::models::{Task, TaskStatus};

/// Optional filters shared by [`list_tasks`] and [`count_tasks`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub pipeline_id: Option<String>,
}

/// Insert a fully-formed task row.
pub async fn insert_task<'e, E>(ex: E, task: &Task) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO tasks (id, type, status, priority, manual_rank, summary, prompt, \
         acceptance_criteria, definition_of_done, backend, backend_config, result, \
         lease_owner, lease_expires_at, attempt_count, bounce_count, max_attempts, \
         max_bounces, last_error, feedback_history, depends_on, pipeline_id, \
         pipeline_step, gates, metadata, auto_review, parent_task_id, loop_iteration, \
         held_by, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, \
         ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&task.id)
    .bind(&task.task_type)
    .bind(task.status)
    .bind(task.priority)
    .bind(task.manual_rank)
    .bind(&task.summary)
    .bind(&task.prompt)
    .bind(&task.acceptance_criteria)
    .bind(&task.definition_of_done)
    .bind(&task.backend)
    .bind(&task.backend_config)
    .bind(&task.result)
    .bind(&task.lease_owner)
    .bind(task.lease_expires_at)
    .bind(task.attempt_count)
    .bind(task.bounce_count)
    .bind(task.max_attempts)
    .bind(task.max_bounces)
    .bind(&task.last_error)
    .bind(&task.feedback_history)
    .bind(&task.depends_on)
    .bind(&task.pipeline_id)
    .bind(task.pipeline_step)
    .bind(&task.gates)
    .bind(&task.metadata)
    .bind(&task.auto_review)
    .bind(&task.parent_task_id)
    .bind(task.loop_iteration)
    .bind(&task.held_by)
    .bind(task.created_at)
    .bind(task.updated_at)
    .execute(ex)
    .await
    .context("failed to insert task")?;

    Ok(())
}

/// Fetch a single task by ID.
pub async fn get_task<'e, E>(ex: E, id: &str) -> Result<Option<Task>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(ex)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Check whether a task row exists.
pub async fn task_exists<'e, E>(ex: E, id: &str) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(ex)
        .await
        .context("failed to check task existence")?;
    Ok(row.is_some())
}

/// Write every mutable column of a task row.
///
/// Uses optimistic locking: the WHERE clause includes `status = ?`, so the
/// row is only written if the current status matches `expected_status`.
/// Returns the number of rows affected (0 means the status did not match
/// or the task does not exist).
pub async fn update_task_row<'e, E>(
    ex: E,
    task: &Task,
    expected_status: TaskStatus,
) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE tasks SET \
         status = ?, priority = ?, manual_rank = ?, summary = ?, prompt = ?, \
         acceptance_criteria = ?, definition_of_done = ?, backend = ?, \
         backend_config = ?, result = ?, lease_owner = ?, lease_expires_at = ?, \
         attempt_count = ?, bounce_count = ?, max_attempts = ?, max_bounces = ?, \
         last_error = ?, feedback_history = ?, depends_on = ?, pipeline_id = ?, \
         pipeline_step = ?, gates = ?, metadata = ?, auto_review = ?, \
         parent_task_id = ?, loop_iteration = ?, held_by = ?, updated_at = ? \
         WHERE id = ? AND status = ?",
    )
    .bind(task.status)
    .bind(task.priority)
    .bind(task.manual_rank)
    .bind(&task.summary)
    .bind(&task.prompt)
    .bind(&task.acceptance_criteria)
    .bind(&task.definition_of_done)
    .bind(&task.backend)
    .bind(&task.backend_config)
    .bind(&task.result)
    .bind(&task.lease_owner)
    .bind(task.lease_expires_at)
    .bind(task.attempt_count)
    .bind(task.bounce_count)
    .bind(task.max_attempts)
    .bind(task.max_bounces)
    .bind(&task.last_error)
    .bind(&task.feedback_history)
    .bind(&task.depends_on)
    .bind(&task.pipeline_id)
    .bind(task.pipeline_step)
    .bind(&task.gates)
    .bind(&task.metadata)
    .bind(&task.auto_review)
    .bind(&task.parent_task_id)
    .bind(task.loop_iteration)
    .bind(&task.held_by)
    .bind(task.updated_at)
    .bind(&task.id)
    .bind(expected_status)
    .execute(ex)
    .await
    .context("failed to update task row")?;

    Ok(result.rows_affected())
}

/// Extend the lease of an in-progress task (heartbeat).
pub async fn update_lease_expiry<'e, E>(
    ex: E,
    id: &str,
    lease_expires_at: DateTime<Utc>,
) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE tasks SET lease_expires_at = ?, updated_at = ? \
         WHERE id = ? AND status = 'IN_PROGRESS'",
    )
    .bind(lease_expires_at)
    .bind(Utc::now())
    .bind(id)
    .execute(ex)
    .await
    .context("failed to update lease expiry")?;

    Ok(result.rows_affected())
}

/// Overwrite the manual rank of a single task.
pub async fn set_manual_rank<'e, E>(ex: E, id: &str, rank: Option<f64>) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("UPDATE tasks SET manual_rank = ?, updated_at = ? WHERE id = ?")
        .bind(rank)
        .bind(Utc::now())
        .bind(id)
        .execute(ex)
        .await
        .context("failed to set manual rank")?;

    Ok(result.rows_affected())
}

/// List tasks matching the filter, ordered by creation time then id.
pub async fn list_tasks(
    pool: &SqlitePool,
    filter: &TaskFilter,
    limit: i64,
    offset: i64,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE (?1 IS NULL OR status = ?1) \
           AND (?2 IS NULL OR type = ?2) \
           AND (?3 IS NULL OR pipeline_id = ?3) \
         ORDER BY created_at ASC, id ASC \
         LIMIT ?4 OFFSET ?5",
    )
    .bind(filter.status)
    .bind(&filter.task_type)
    .bind(&filter.pipeline_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("failed to list tasks")?;

    Ok(tasks)
}

/// Count tasks matching the filter.
pub async fn count_tasks(pool: &SqlitePool, filter: &TaskFilter) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks \
         WHERE (?1 IS NULL OR status = ?1) \
           AND (?2 IS NULL OR type = ?2) \
           AND (?3 IS NULL OR pipeline_id = ?3)",
    )
    .bind(filter.status)
    .bind(&filter.task_type)
    .bind(&filter.pipeline_id)
    .fetch_one(pool)
    .await
    .context("failed to count tasks")?;

    Ok(row.0)
}

/// List claim-eligible pending tasks in queue order.
///
/// Ordering: priority ascending, ranked rows before unranked, manual rank
/// ascending, then creation time with the ULID as the final stable
/// tiebreaker. Held tasks are excluded.
pub async fn list_pending_ordered<'e, E>(ex: E, task_type: Option<&str>) -> Result<Vec<Task>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'PENDING' \
           AND held_by IS NULL \
           AND (?1 IS NULL OR type = ?1) \
         ORDER BY priority ASC, (manual_rank IS NULL) ASC, manual_rank ASC, \
                  created_at ASC, id ASC",
    )
    .bind(task_type)
    .fetch_all(ex)
    .await
    .context("failed to list pending tasks")?;

    Ok(tasks)
}

/// List all tasks in a given status, ordered by creation time.
pub async fn list_by_status(pool: &SqlitePool, status: TaskStatus) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = ? ORDER BY created_at ASC, id ASC",
    )
    .bind(status)
    .fetch_all(pool)
    .await
    .context("failed to list tasks by status")?;

    Ok(tasks)
}

/// Count of tasks per status.
pub async fn status_counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
            .fetch_all(pool)
            .await
            .context("failed to count tasks by status")?;

    Ok(rows)
}

/// Number of IN_PROGRESS tasks of a given type. Used for WIP limits.
pub async fn count_in_progress_of_type(pool: &SqlitePool, task_type: &str) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks WHERE status = 'IN_PROGRESS' AND type = ?",
    )
    .bind(task_type)
    .fetch_one(pool)
    .await
    .context("failed to count in-progress tasks")?;

    Ok(row.0)
}

/// List all tasks in a pipeline, ordered by topological layer.
pub async fn list_pipeline_tasks(pool: &SqlitePool, pipeline_id: &str) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE pipeline_id = ? \
         ORDER BY pipeline_step ASC, created_at ASC, id ASC",
    )
    .bind(pipeline_id)
    .fetch_all(pool)
    .await
    .context("failed to list pipeline tasks")?;

    Ok(tasks)
}

/// Distinct pipeline IDs, newest first (ULID order).
pub async fn list_pipeline_ids(pool: &SqlitePool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT pipeline_id FROM tasks \
         WHERE pipeline_id IS NOT NULL ORDER BY pipeline_id DESC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list pipeline ids")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Set or clear the hold marker on every PENDING task in a pipeline.
/// Returns the number of tasks touched.
pub async fn set_held_by_for_pipeline<'e, E>(
    ex: E,
    pipeline_id: &str,
    held_by: Option<&str>,
) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE tasks SET held_by = ?, updated_at = ? \
         WHERE pipeline_id = ? AND status = 'PENDING'",
    )
    .bind(held_by)
    .bind(Utc::now())
    .bind(pipeline_id)
    .execute(ex)
    .await
    .context("failed to update pipeline hold")?;

    Ok(result.rows_affected())
}

/// List the children of a task (spawned by auto-review or expansion).
pub async fn list_children<'e, E>(ex: E, parent_task_id: &str) -> Result<Vec<Task>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE parent_task_id = ? ORDER BY created_at ASC, id ASC",
    )
    .bind(parent_task_id)
    .fetch_all(ex)
    .await
    .context("failed to list child tasks")?;

    Ok(tasks)
}

/// All `(id, depends_on)` pairs, for whole-graph acyclicity checks.
pub async fn list_dependency_pairs<'e, E>(ex: E) -> Result<Vec<(String, Vec<String>)>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(String, Json<Vec<String>>)> =
        sqlx::query_as("SELECT id, depends_on FROM tasks")
            .fetch_all(ex)
            .await
            .context("failed to list dependency pairs")?;

    Ok(rows.into_iter().map(|(id, deps)| (id, deps.0)).collect())
}
