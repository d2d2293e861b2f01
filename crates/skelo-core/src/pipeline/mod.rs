//! DAG pipelines: validation, topological layering, atomic creation,
//! dependency readiness, upstream result propagation, and hold/resume.
//!
//! Validation order (each failure aborts the whole request):
//! 1. at least one node, 2. unique keys, 3. known dependencies and no
//! self-loops, 4. acyclic graph, 5. at least one root.

pub mod expand;

use std::collections::{HashMap, HashSet};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use thiserror::Error;

use skelo_db::ids;
use skelo_db::models::{
    AutoReviewConfig, BackendConfig, GateSpec, Task, TaskStatus,
};
use skelo_db::queries::audit::{self, NewAuditEntry};
use skelo_db::queries::tasks as db;

use crate::error::SkeloError;
use crate::store::{self, CreateTaskInput};
use crate::webhook::{WebhookEventKind, WebhookNotifier};

// ---------------------------------------------------------------------------
// Input types
// ---------------------------------------------------------------------------

/// One node of a DAG pipeline request, addressed by `key` before ids exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagNode {
    pub key: String,
    #[serde(rename = "type", default)]
    pub task_type: String,
    pub summary: String,
    pub prompt: String,
    pub backend: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub definition_of_done: Vec<String>,
    #[serde(default)]
    pub max_attempts: Option<i64>,
    #[serde(default)]
    pub max_bounces: Option<i64>,
    #[serde(default)]
    pub auto_review: Option<AutoReviewConfig>,
    #[serde(default)]
    pub expand: bool,
    #[serde(default)]
    pub expand_config: Option<serde_json::Value>,
    #[serde(default)]
    pub gates: Vec<GateSpec>,
    #[serde(default)]
    pub backend_config: Option<BackendConfig>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Request body for pipeline creation.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateDagPipelineInput {
    pub tasks: Vec<DagNode>,
}

/// Errors from pipeline validation.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline must contain at least one task")]
    NoTasks,

    #[error("duplicate task key: {0:?}")]
    DuplicateKey(String),

    #[error("task {task:?} depends on unknown key {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("task {0:?} depends on itself")]
    SelfDependency(String),

    #[error("Cycle detected involving tasks: {0}")]
    CycleDetected(String),

    #[error("pipeline has no root tasks (every task has dependencies)")]
    NoRoots,
}

impl From<PipelineError> for SkeloError {
    fn from(e: PipelineError) -> Self {
        SkeloError::Validation(e.to_string())
    }
}

/// Summary row for the pipeline listing endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub pipeline_id: String,
    pub task_count: i64,
    pub completed: i64,
    pub status: String,
}

// ---------------------------------------------------------------------------
// Validation & layering
// ---------------------------------------------------------------------------

/// Validate a pipeline request. See the module docs for the check order.
pub fn validate(input: &CreateDagPipelineInput) -> Result<(), PipelineError> {
    if input.tasks.is_empty() {
        return Err(PipelineError::NoTasks);
    }

    let mut seen = HashSet::new();
    for node in &input.tasks {
        if !seen.insert(node.key.as_str()) {
            return Err(PipelineError::DuplicateKey(node.key.clone()));
        }
    }

    for node in &input.tasks {
        for dep in &node.depends_on {
            if dep == &node.key {
                return Err(PipelineError::SelfDependency(node.key.clone()));
            }
            if !seen.contains(dep.as_str()) {
                return Err(PipelineError::UnknownDependency {
                    task: node.key.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    check_for_cycles(input)?;

    if !input.tasks.iter().any(|n| n.depends_on.is_empty()) {
        return Err(PipelineError::NoRoots);
    }

    Ok(())
}

/// Detect cycles with a colored depth-first search.
fn check_for_cycles(input: &CreateDagPipelineInput) -> Result<(), PipelineError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Grey,
        Black,
    }

    let deps: HashMap<&str, &Vec<String>> = input
        .tasks
        .iter()
        .map(|n| (n.key.as_str(), &n.depends_on))
        .collect();

    fn visit<'a>(
        node: &'a str,
        deps: &HashMap<&'a str, &'a Vec<String>>,
        colors: &mut HashMap<&'a str, Color>,
        stuck: &mut Vec<&'a str>,
    ) -> bool {
        match colors.get(node).copied().unwrap_or(Color::White) {
            Color::Black => return true,
            Color::Grey => {
                stuck.push(node);
                return false;
            }
            Color::White => {}
        }
        colors.insert(node, Color::Grey);
        if let Some(node_deps) = deps.get(node) {
            for dep in node_deps.iter() {
                if !visit(dep, deps, colors, stuck) {
                    stuck.push(node);
                    return false;
                }
            }
        }
        colors.insert(node, Color::Black);
        true
    }

    let mut colors = HashMap::new();
    for node in deps.keys() {
        let mut stuck = Vec::new();
        if !visit(node, &deps, &mut colors, &mut stuck) {
            stuck.reverse();
            return Err(PipelineError::CycleDetected(stuck.join(", ")));
        }
    }
    Ok(())
}

/// Compute the topological layer of each node: 0 for roots, otherwise one
/// more than the deepest dependency. The graph must already be validated.
pub fn compute_steps(input: &CreateDagPipelineInput) -> HashMap<String, i64> {
    let deps: HashMap<&str, &Vec<String>> = input
        .tasks
        .iter()
        .map(|n| (n.key.as_str(), &n.depends_on))
        .collect();

    fn step_of<'a>(
        node: &'a str,
        deps: &HashMap<&'a str, &'a Vec<String>>,
        memo: &mut HashMap<&'a str, i64>,
    ) -> i64 {
        if let Some(&s) = memo.get(node) {
            return s;
        }
        let node_deps = deps.get(node).copied();
        let s = match node_deps {
            None => 0,
            Some(d) if d.is_empty() => 0,
            Some(d) => {
                1 + d
                    .iter()
                    .map(|dep| step_of(dep, deps, memo))
                    .max()
                    .unwrap_or(0)
            }
        };
        memo.insert(node, s);
        s
    }

    let mut memo = HashMap::new();
    input
        .tasks
        .iter()
        .map(|n| {
            let s = step_of(n.key.as_str(), &deps, &mut memo);
            (n.key.clone(), s)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

fn node_to_input(node: &DagNode, pipeline_id: &str, step: i64, deps: Vec<String>) -> CreateTaskInput {
    let mut metadata = node
        .metadata
        .clone()
        .unwrap_or_else(|| serde_json::json!({}));
    if node.expand {
        if let Some(obj) = metadata.as_object_mut() {
            obj.insert("expand".into(), true.into());
            if let Some(ref cfg) = node.expand_config {
                obj.insert("expand_config".into(), cfg.clone());
            }
        }
    }

    CreateTaskInput {
        task_type: node.task_type.clone(),
        summary: node.summary.clone(),
        prompt: node.prompt.clone(),
        backend: node.backend.clone(),
        priority: node.priority.unwrap_or(0),
        acceptance_criteria: node.acceptance_criteria.clone(),
        definition_of_done: node.definition_of_done.clone(),
        backend_config: node.backend_config.clone(),
        max_attempts: node.max_attempts,
        max_bounces: node.max_bounces,
        depends_on: deps,
        pipeline_id: Some(pipeline_id.to_owned()),
        pipeline_step: Some(step),
        gates: node.gates.clone(),
        metadata: Some(metadata),
        auto_review: node.auto_review.clone(),
        parent_task_id: None,
        held_by: None,
    }
}

/// Create a validated DAG pipeline. All tasks commit in one transaction or
/// none do. Returns the pipeline id and the tasks in topological order.
pub async fn create_dag_pipeline(
    pool: &SqlitePool,
    input: &CreateDagPipelineInput,
) -> Result<(String, Vec<Task>), SkeloError> {
    validate(input)?;

    let steps = compute_steps(input);
    let pipeline_id = ids::new_id();

    // Pre-assign ids so depends_on keys can be rewritten to ids, then
    // create in topological order.
    let mut id_by_key: HashMap<&str, String> = HashMap::new();
    for node in &input.tasks {
        id_by_key.insert(node.key.as_str(), ids::new_id());
    }

    let mut ordered: Vec<&DagNode> = input.tasks.iter().collect();
    ordered.sort_by_key(|n| (steps[&n.key], n.key.clone()));

    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let mut tasks = Vec::with_capacity(ordered.len());

    for node in ordered {
        let deps: Vec<String> = node
            .depends_on
            .iter()
            .map(|k| id_by_key[k.as_str()].clone())
            .collect();
        let task_input = node_to_input(node, &pipeline_id, steps[&node.key], deps);
        let task = store::build_task(&task_input, id_by_key[node.key.as_str()].clone());

        db::insert_task(&mut *tx, &task).await?;
        audit::append(
            &mut *tx,
            &NewAuditEntry {
                task_id: &task.id,
                action: "create",
                actor: None,
                before_state: None,
                after_state: Some("PENDING"),
                metadata: Some(serde_json::json!({
                    "pipeline_id": pipeline_id,
                    "key": node.key,
                    "pipeline_step": steps[&node.key],
                })),
            },
        )
        .await?;
        tasks.push(task);
    }

    tx.commit().await.context("failed to commit transaction")?;
    Ok((pipeline_id, tasks))
}

/// Create a linear pipeline: each task depends on the previous one, with
/// 1-based step numbers. A convenience wrapper over the same storage path.
pub async fn create_pipeline(
    pool: &SqlitePool,
    stages: &[CreateTaskInput],
) -> Result<(String, Vec<Task>), SkeloError> {
    if stages.is_empty() {
        return Err(PipelineError::NoTasks.into());
    }

    let pipeline_id = ids::new_id();
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let mut tasks: Vec<Task> = Vec::with_capacity(stages.len());

    for (i, stage) in stages.iter().enumerate() {
        let mut input = stage.clone();
        input.pipeline_id = Some(pipeline_id.clone());
        input.pipeline_step = Some(i as i64 + 1);
        input.depends_on = tasks.last().map(|t: &Task| vec![t.id.clone()]).unwrap_or_default();
        let task = store::create_in_tx(&mut tx, &input, None).await?;
        tasks.push(task);
    }

    tx.commit().await.context("failed to commit transaction")?;
    Ok((pipeline_id, tasks))
}

// ---------------------------------------------------------------------------
// Readiness & propagation
// ---------------------------------------------------------------------------

/// True iff every dependency of the task is DONE.
pub async fn dependencies_met(pool: &SqlitePool, task: &Task) -> Result<bool, SkeloError> {
    for dep_id in &task.depends_on.0 {
        let dep = db::get_task(pool, dep_id)
            .await?
            .ok_or_else(|| SkeloError::not_found(format!("dependency task {dep_id}")))?;
        if dep.status != TaskStatus::Done {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Collect the results of a task's dependencies, keyed by dependency id.
/// Results that parse as JSON are passed parsed; everything else raw.
pub async fn upstream_results(
    pool: &SqlitePool,
    task: &Task,
) -> Result<HashMap<String, serde_json::Value>, SkeloError> {
    let mut results = HashMap::new();
    for dep_id in &task.depends_on.0 {
        let Some(dep) = db::get_task(pool, dep_id).await? else {
            continue;
        };
        let Some(raw) = dep.result else { continue };
        if raw.is_empty() {
            continue;
        }
        let value = serde_json::from_str(&raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.clone()));
        results.insert(dep_id.clone(), value);
    }
    Ok(results)
}

// ---------------------------------------------------------------------------
// Step recomputation (after expansion rewires edges)
// ---------------------------------------------------------------------------

/// Recompute `pipeline_step` for every task in a pipeline as the longest
/// dependency path to a root, considering only in-pipeline edges.
pub(crate) async fn recompute_steps(
    conn: &mut SqliteConnection,
    pipeline_id: &str,
) -> Result<(), SkeloError> {
    let rows: Vec<Task> = sqlx::query_as(
        "SELECT * FROM tasks WHERE pipeline_id = ? ORDER BY created_at ASC, id ASC",
    )
    .bind(pipeline_id)
    .fetch_all(&mut *conn)
    .await
    .context("failed to list pipeline tasks")?;

    let in_pipeline: HashSet<&str> = rows.iter().map(|t| t.id.as_str()).collect();
    let deps: HashMap<&str, Vec<&str>> = rows
        .iter()
        .map(|t| {
            (
                t.id.as_str(),
                t.depends_on
                    .0
                    .iter()
                    .map(String::as_str)
                    .filter(|d| in_pipeline.contains(d))
                    .collect(),
            )
        })
        .collect();

    fn step_of<'a>(
        node: &'a str,
        deps: &HashMap<&'a str, Vec<&'a str>>,
        memo: &mut HashMap<&'a str, i64>,
    ) -> i64 {
        if let Some(&s) = memo.get(node) {
            return s;
        }
        let s = match deps.get(node) {
            None => 0,
            Some(d) if d.is_empty() => 0,
            Some(d) => 1 + d.iter().map(|x| step_of(x, deps, memo)).max().unwrap_or(0),
        };
        memo.insert(node, s);
        s
    }

    let mut memo = HashMap::new();
    for task in &rows {
        let step = step_of(task.id.as_str(), &deps, &mut memo);
        if task.pipeline_step != Some(step) {
            sqlx::query("UPDATE tasks SET pipeline_step = ? WHERE id = ?")
                .bind(step)
                .bind(&task.id)
                .execute(&mut *conn)
                .await
                .context("failed to update pipeline step")?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Hold / resume & summaries
// ---------------------------------------------------------------------------

/// Mark every PENDING task of a pipeline as held, removing them from claim
/// eligibility. Returns the number of tasks held.
pub async fn hold_pipeline(
    pool: &SqlitePool,
    pipeline_id: &str,
    holder: &str,
    notifier: Option<&WebhookNotifier>,
) -> Result<u64, SkeloError> {
    let tasks = db::list_pipeline_tasks(pool, pipeline_id).await?;
    if tasks.is_empty() {
        return Err(SkeloError::not_found(format!("pipeline {pipeline_id}")));
    }

    let held = db::set_held_by_for_pipeline(pool, pipeline_id, Some(holder)).await?;
    if let (Some(notifier), Some(first)) = (notifier, tasks.first()) {
        notifier.emit_task(WebhookEventKind::PipelineHeld, first);
    }
    Ok(held)
}

/// Clear the hold marker from a pipeline's PENDING tasks.
pub async fn resume_pipeline(
    pool: &SqlitePool,
    pipeline_id: &str,
    notifier: Option<&WebhookNotifier>,
) -> Result<u64, SkeloError> {
    let tasks = db::list_pipeline_tasks(pool, pipeline_id).await?;
    if tasks.is_empty() {
        return Err(SkeloError::not_found(format!("pipeline {pipeline_id}")));
    }

    let resumed = db::set_held_by_for_pipeline(pool, pipeline_id, None).await?;
    if let (Some(notifier), Some(first)) = (notifier, tasks.first()) {
        notifier.emit_task(WebhookEventKind::PipelineResumed, first);
    }
    Ok(resumed)
}

/// Summaries of every pipeline, newest first.
pub async fn list_pipelines(
    pool: &SqlitePool,
    status_filter: Option<&str>,
) -> Result<Vec<PipelineSummary>, SkeloError> {
    let mut summaries = Vec::new();
    for pipeline_id in db::list_pipeline_ids(pool).await? {
        let tasks = db::list_pipeline_tasks(pool, &pipeline_id).await?;
        let task_count = tasks.len() as i64;
        let completed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .count() as i64;

        let status = if completed == task_count {
            "complete"
        } else if tasks.iter().any(|t| t.status == TaskStatus::Blocked) {
            "blocked"
        } else if tasks.iter().any(|t| t.held_by.is_some()) {
            "held"
        } else {
            "running"
        };

        if let Some(want) = status_filter {
            if status != want {
                continue;
            }
        }

        summaries.push(PipelineSummary {
            pipeline_id,
            task_count,
            completed,
            status: status.to_owned(),
        });
    }
    Ok(summaries)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
