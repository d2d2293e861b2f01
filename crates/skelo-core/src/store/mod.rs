//! The validated task store.
//!
//! Wraps the row-level queries in `skelo-db` with input validation,
//! dependency-graph checks, audit logging, and transactions. Status is
//! never writable through this module; use [`crate::state`] transitions.

use std::collections::{HashMap, HashSet};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{SqliteConnection, SqlitePool};

use skelo_db::ids;
use skelo_db::models::{
    AutoReviewConfig, BackendConfig, GateSpec, Task, TaskStatus,
};
use skelo_db::queries::audit::{self, NewAuditEntry};
use skelo_db::queries::tasks as db;
pub use skelo_db::queries::tasks::TaskFilter;

use crate::error::SkeloError;

/// Input for creating a task. Serde defaults make every field except
/// `summary`, `prompt`, and `backend` optional on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTaskInput {
    #[serde(rename = "type", default)]
    pub task_type: String,
    pub summary: String,
    pub prompt: String,
    pub backend: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub definition_of_done: Vec<String>,
    #[serde(default)]
    pub backend_config: Option<BackendConfig>,
    #[serde(default)]
    pub max_attempts: Option<i64>,
    #[serde(default)]
    pub max_bounces: Option<i64>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub pipeline_id: Option<String>,
    #[serde(default)]
    pub pipeline_step: Option<i64>,
    #[serde(default)]
    pub gates: Vec<GateSpec>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub auto_review: Option<AutoReviewConfig>,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub held_by: Option<String>,
}

/// A typed partial update. The fields of this struct are the literal
/// allow-list of updatable columns; `status` is deliberately absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPatch {
    pub priority: Option<i64>,
    pub summary: Option<String>,
    pub prompt: Option<String>,
    pub acceptance_criteria: Option<Vec<String>>,
    pub definition_of_done: Option<Vec<String>>,
    pub backend: Option<String>,
    pub backend_config: Option<BackendConfig>,
    pub result: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub depends_on: Option<Vec<String>>,
    pub gates: Option<Vec<GateSpec>>,
    pub metadata: Option<serde_json::Value>,
    pub auto_review: Option<AutoReviewConfig>,
    pub max_attempts: Option<i64>,
    pub max_bounces: Option<i64>,
    /// `Some(None)` clears the hold, `Some(Some(owner))` sets it.
    #[serde(skip)]
    pub held_by: Option<Option<String>>,
}

/// Input for [`inject`]: a create plus queue-jumping extras.
#[derive(Debug, Clone, Deserialize)]
pub struct InjectInput {
    #[serde(flatten)]
    pub task: CreateTaskInput,
    #[serde(default)]
    pub priority_boost: Option<i64>,
    #[serde(default)]
    pub inject_before: Option<String>,
}

// ---------------------------------------------------------------------------
// Graph helpers
// ---------------------------------------------------------------------------

/// Assert that the dependency graph is acyclic.
///
/// DFS with white/grey/black coloring; a grey-to-grey edge is a cycle.
pub(crate) fn assert_acyclic(
    edges: &HashMap<String, Vec<String>>,
) -> Result<(), SkeloError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Grey,
        Black,
    }

    fn visit(
        node: &str,
        edges: &HashMap<String, Vec<String>>,
        colors: &mut HashMap<String, Color>,
        trail: &mut Vec<String>,
    ) -> bool {
        match colors.get(node).copied().unwrap_or(Color::White) {
            Color::Black => return true,
            Color::Grey => {
                trail.push(node.to_owned());
                return false;
            }
            Color::White => {}
        }
        colors.insert(node.to_owned(), Color::Grey);
        if let Some(deps) = edges.get(node) {
            for dep in deps {
                if !visit(dep, edges, colors, trail) {
                    trail.push(node.to_owned());
                    return false;
                }
            }
        }
        colors.insert(node.to_owned(), Color::Black);
        true
    }

    let mut colors = HashMap::new();
    for node in edges.keys() {
        let mut trail = Vec::new();
        if !visit(node, edges, &mut colors, &mut trail) {
            trail.reverse();
            return Err(SkeloError::Validation(format!(
                "Cycle detected involving tasks: {}",
                trail.join(" -> ")
            )));
        }
    }
    Ok(())
}

/// Load the whole dependency graph and verify it stays acyclic with the
/// given node's edges replaced.
async fn assert_graph_acyclic_with(
    conn: &mut SqliteConnection,
    node_id: &str,
    deps: &[String],
) -> Result<(), SkeloError> {
    let mut edges: HashMap<String, Vec<String>> = db::list_dependency_pairs(&mut *conn)
        .await?
        .into_iter()
        .collect();
    edges.insert(node_id.to_owned(), deps.to_vec());
    assert_acyclic(&edges)
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Build a PENDING task row from a create input. The caller owns id
/// allocation so pipeline creation can pre-assign ids for key resolution.
pub(crate) fn build_task(input: &CreateTaskInput, id: String) -> Task {
    let now = Utc::now();
    Task {
        id,
        task_type: if input.task_type.is_empty() {
            "task".to_owned()
        } else {
            input.task_type.clone()
        },
        status: TaskStatus::Pending,
        priority: input.priority,
        manual_rank: None,
        summary: input.summary.clone(),
        prompt: input.prompt.clone(),
        acceptance_criteria: Json(input.acceptance_criteria.clone()),
        definition_of_done: Json(input.definition_of_done.clone()),
        backend: input.backend.clone(),
        backend_config: input.backend_config.clone().map(Json),
        result: None,
        lease_owner: None,
        lease_expires_at: None,
        attempt_count: 0,
        bounce_count: 0,
        max_attempts: input.max_attempts.unwrap_or(5),
        max_bounces: input.max_bounces.unwrap_or(3),
        last_error: None,
        feedback_history: Json(Vec::new()),
        depends_on: Json(input.depends_on.clone()),
        pipeline_id: input.pipeline_id.clone(),
        pipeline_step: input.pipeline_step,
        gates: Json(input.gates.clone()),
        metadata: Json(
            input
                .metadata
                .clone()
                .unwrap_or_else(|| serde_json::json!({})),
        ),
        auto_review: input.auto_review.clone().map(Json),
        parent_task_id: input.parent_task_id.clone(),
        loop_iteration: 0,
        held_by: input.held_by.clone(),
        created_at: now,
        updated_at: now,
    }
}

fn validate_input(input: &CreateTaskInput) -> Result<(), SkeloError> {
    if input.summary.trim().is_empty() {
        return Err(SkeloError::validation("summary is required"));
    }
    if input.prompt.trim().is_empty() {
        return Err(SkeloError::validation("prompt is required"));
    }
    if input.backend.trim().is_empty() {
        return Err(SkeloError::validation("backend is required"));
    }
    let unique: HashSet<&String> = input.depends_on.iter().collect();
    if unique.len() != input.depends_on.len() {
        return Err(SkeloError::validation("duplicate ids in depends_on"));
    }
    Ok(())
}

/// Create a task inside an existing transaction. Validates dependency
/// existence and whole-graph acyclicity, inserts the row, and writes a
/// `create` audit entry.
pub(crate) async fn create_in_tx(
    conn: &mut SqliteConnection,
    input: &CreateTaskInput,
    actor: Option<&str>,
) -> Result<Task, SkeloError> {
    validate_input(input)?;

    for dep in &input.depends_on {
        if !db::task_exists(&mut *conn, dep).await? {
            return Err(SkeloError::validation(format!(
                "depends_on references unknown task {dep}"
            )));
        }
    }

    let task = build_task(input, ids::new_id());
    assert_graph_acyclic_with(conn, &task.id, &task.depends_on.0).await?;

    db::insert_task(&mut *conn, &task).await?;
    audit::append(
        &mut *conn,
        &NewAuditEntry {
            task_id: &task.id,
            action: "create",
            actor,
            before_state: None,
            after_state: Some("PENDING"),
            metadata: Some(serde_json::json!({
                "type": task.task_type,
                "backend": task.backend,
                "pipeline_id": task.pipeline_id,
            })),
        },
    )
    .await?;

    Ok(task)
}

// ---------------------------------------------------------------------------
// Public operations
// ---------------------------------------------------------------------------

/// Create a task. Returns the hydrated row.
pub async fn create(pool: &SqlitePool, input: &CreateTaskInput) -> Result<Task, SkeloError> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let task = create_in_tx(&mut tx, input, None).await?;
    tx.commit().await.context("failed to commit transaction")?;
    Ok(task)
}

/// Fetch a task or fail with `NotFound`.
pub async fn get(pool: &SqlitePool, id: &str) -> Result<Task, SkeloError> {
    db::get_task(pool, id)
        .await?
        .ok_or_else(|| SkeloError::not_found(format!("task {id}")))
}

/// Apply a typed partial update. Re-validates the dependency graph when
/// `depends_on` changes and recomputes `updated_at`.
pub async fn update(
    pool: &SqlitePool,
    id: &str,
    patch: &TaskPatch,
) -> Result<Task, SkeloError> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let mut task = db::get_task(&mut *tx, id)
        .await?
        .ok_or_else(|| SkeloError::not_found(format!("task {id}")))?;
    let expected_status = task.status;
    let mut changed: Vec<&str> = Vec::new();

    if let Some(v) = patch.priority {
        task.priority = v;
        changed.push("priority");
    }
    if let Some(ref v) = patch.summary {
        task.summary = v.clone();
        changed.push("summary");
    }
    if let Some(ref v) = patch.prompt {
        task.prompt = v.clone();
        changed.push("prompt");
    }
    if let Some(ref v) = patch.acceptance_criteria {
        task.acceptance_criteria = Json(v.clone());
        changed.push("acceptance_criteria");
    }
    if let Some(ref v) = patch.definition_of_done {
        task.definition_of_done = Json(v.clone());
        changed.push("definition_of_done");
    }
    if let Some(ref v) = patch.backend {
        task.backend = v.clone();
        changed.push("backend");
    }
    if let Some(ref v) = patch.backend_config {
        task.backend_config = Some(Json(v.clone()));
        changed.push("backend_config");
    }
    if let Some(ref v) = patch.result {
        task.result = Some(v.clone());
        changed.push("result");
    }
    if let Some(v) = patch.lease_expires_at {
        task.lease_expires_at = Some(v);
        changed.push("lease_expires_at");
    }
    if let Some(ref v) = patch.last_error {
        task.last_error = Some(v.clone());
        changed.push("last_error");
    }
    if let Some(ref v) = patch.depends_on {
        let unique: HashSet<&String> = v.iter().collect();
        if unique.len() != v.len() {
            return Err(SkeloError::validation("duplicate ids in depends_on"));
        }
        for dep in v {
            if dep == id {
                return Err(SkeloError::validation(format!(
                    "task {id} cannot depend on itself"
                )));
            }
            if !db::task_exists(&mut *tx, dep).await? {
                return Err(SkeloError::validation(format!(
                    "depends_on references unknown task {dep}"
                )));
            }
        }
        assert_graph_acyclic_with(&mut tx, id, v).await?;
        task.depends_on = Json(v.clone());
        changed.push("depends_on");
    }
    if let Some(ref v) = patch.gates {
        task.gates = Json(v.clone());
        changed.push("gates");
    }
    if let Some(ref v) = patch.metadata {
        task.metadata = Json(v.clone());
        changed.push("metadata");
    }
    if let Some(ref v) = patch.auto_review {
        task.auto_review = Some(Json(v.clone()));
        changed.push("auto_review");
    }
    if let Some(v) = patch.max_attempts {
        task.max_attempts = v;
        changed.push("max_attempts");
    }
    if let Some(v) = patch.max_bounces {
        task.max_bounces = v;
        changed.push("max_bounces");
    }
    if let Some(ref v) = patch.held_by {
        task.held_by = v.clone();
        changed.push("held_by");
    }

    if changed.is_empty() {
        tx.commit().await.context("failed to commit transaction")?;
        return Ok(task);
    }

    task.updated_at = Utc::now();
    let rows = db::update_task_row(&mut *tx, &task, expected_status).await?;
    if rows == 0 {
        return Err(SkeloError::Transition {
            from: expected_status,
            to: expected_status,
            reason: "task changed concurrently during update".to_owned(),
        });
    }

    audit::append(
        &mut *tx,
        &NewAuditEntry {
            task_id: &task.id,
            action: "update",
            actor: None,
            before_state: None,
            after_state: None,
            metadata: Some(serde_json::json!({ "fields": changed })),
        },
    )
    .await?;

    tx.commit().await.context("failed to commit transaction")?;
    Ok(task)
}

/// List tasks matching the filter.
pub async fn list(
    pool: &SqlitePool,
    filter: &TaskFilter,
    limit: i64,
    offset: i64,
) -> Result<Vec<Task>, SkeloError> {
    Ok(db::list_tasks(pool, filter, limit, offset).await?)
}

/// Count tasks matching the filter.
pub async fn count(pool: &SqlitePool, filter: &TaskFilter) -> Result<i64, SkeloError> {
    Ok(db::count_tasks(pool, filter).await?)
}

/// Create a task with queue-jumping extras: an optional priority override
/// and an optional `inject_before` target whose `depends_on` gains the new
/// task (so the target cannot run before it).
pub async fn inject(pool: &SqlitePool, input: &InjectInput) -> Result<Task, SkeloError> {
    let mut create_input = input.task.clone();
    if let Some(boost) = input.priority_boost {
        create_input.priority = boost;
    }

    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let task = create_in_tx(&mut tx, &create_input, None).await?;

    if let Some(ref target_id) = input.inject_before {
        let mut target = db::get_task(&mut *tx, target_id)
            .await?
            .ok_or_else(|| SkeloError::not_found(format!("task {target_id}")))?;
        if !target.depends_on.0.contains(&task.id) {
            let mut deps = target.depends_on.0.clone();
            deps.push(task.id.clone());
            assert_graph_acyclic_with(&mut tx, target_id, &deps).await?;
            target.depends_on = Json(deps);
            target.updated_at = Utc::now();
            let rows = db::update_task_row(&mut *tx, &target, target.status).await?;
            if rows == 0 {
                return Err(SkeloError::Transition {
                    from: target.status,
                    to: target.status,
                    reason: "inject target changed concurrently".to_owned(),
                });
            }
            audit::append(
                &mut *tx,
                &NewAuditEntry {
                    task_id: target_id,
                    action: "inject_before",
                    actor: None,
                    before_state: None,
                    after_state: None,
                    metadata: Some(serde_json::json!({ "injected_task": task.id })),
                },
            )
            .await?;
        }
    }

    tx.commit().await.context("failed to commit transaction")?;
    Ok(task)
}
