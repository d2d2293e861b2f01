//! Dynamic expansion: a completed task whose `metadata.expand` is set
//! materializes additional tasks from its own result.
//!
//! The handler runs when the task first enters REVIEW (or DONE). It is
//! idempotent: children are stamped with `metadata.expanded_from`, and a
//! second invocation that finds such children records
//! `expand_already_applied` and does nothing else.

use anyhow::Context;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::SqlitePool;

use skelo_db::ids;
use skelo_db::models::Task;
use skelo_db::queries::audit::{self, NewAuditEntry};
use skelo_db::queries::tasks as db;

use crate::error::SkeloError;
use crate::store::{self, CreateTaskInput};

/// The most entries honored from an expansion result.
pub const MAX_EXPANSION: usize = 20;

/// One parsed entry of an expansion result.
#[derive(Debug, Clone)]
struct ExpansionEntry {
    summary: String,
    prompt: String,
    task_type: Option<String>,
    backend: Option<String>,
    priority: Option<i64>,
    acceptance_criteria: Vec<String>,
}

fn parse_entries(raw: &str) -> Result<Vec<ExpansionEntry>, SkeloError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| {
        SkeloError::validation(format!("expansion result is not valid JSON: {e}"))
    })?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("tasks") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(SkeloError::validation(
                    "expansion result must be an array or {\"tasks\": [...]}",
                ));
            }
        },
        _ => {
            return Err(SkeloError::validation(
                "expansion result must be an array or {\"tasks\": [...]}",
            ));
        }
    };

    let mut entries = Vec::new();
    for (i, item) in items.into_iter().take(MAX_EXPANSION).enumerate() {
        let summary = item
            .get("summary")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                SkeloError::validation(format!("expansion entry {i} is missing summary"))
            })?
            .to_owned();
        let prompt = item
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                SkeloError::validation(format!("expansion entry {i} is missing prompt"))
            })?
            .to_owned();

        entries.push(ExpansionEntry {
            summary,
            prompt,
            task_type: item
                .get("type")
                .and_then(Value::as_str)
                .map(str::to_owned),
            backend: item
                .get("backend")
                .and_then(Value::as_str)
                .map(str::to_owned),
            priority: item.get("priority").and_then(Value::as_i64),
            acceptance_criteria: item
                .get("acceptance_criteria")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
        });
    }
    Ok(entries)
}

/// Expansion mode taken from `metadata.expand_config.mode`.
fn expansion_mode(parent: &Task) -> &str {
    parent
        .metadata_value("expand_config")
        .and_then(|c| c.get("mode"))
        .and_then(Value::as_str)
        .unwrap_or("parallel")
}

/// Run the expansion protocol for a task that entered REVIEW or DONE.
///
/// Returns the created children; an empty vec when the task does not
/// expand or was already expanded.
pub async fn run_expansion(pool: &SqlitePool, parent: &Task) -> Result<Vec<Task>, SkeloError> {
    if !parent.is_expand() {
        return Ok(Vec::new());
    }

    // Idempotence: children stamped with expanded_from mean a prior run
    // already applied this expansion.
    let existing = db::list_children(pool, &parent.id).await?;
    let already_applied = existing.iter().any(|c| {
        c.metadata_value("expanded_from")
            .and_then(Value::as_str)
            .is_some_and(|from| from == parent.id)
    });
    if already_applied {
        audit::append(
            pool,
            &NewAuditEntry {
                task_id: &parent.id,
                action: "expand_already_applied",
                actor: None,
                before_state: None,
                after_state: None,
                metadata: None,
            },
        )
        .await?;
        return Ok(Vec::new());
    }

    let raw = parent
        .result
        .as_deref()
        .filter(|r| !r.is_empty())
        .ok_or_else(|| SkeloError::validation("expand task has no result to expand"))?;
    let entries = parse_entries(raw)?;
    if entries.is_empty() {
        return Err(SkeloError::validation("expansion result contains no tasks"));
    }

    let sequential = expansion_mode(parent) == "sequential";

    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let mut children: Vec<Task> = Vec::with_capacity(entries.len());

    for (i, entry) in entries.iter().enumerate() {
        let depends_on = if sequential {
            children.last().map(|c: &Task| vec![c.id.clone()]).unwrap_or_default()
        } else {
            Vec::new()
        };

        let input = CreateTaskInput {
            task_type: entry
                .task_type
                .clone()
                .unwrap_or_else(|| parent.task_type.clone()),
            summary: entry.summary.clone(),
            prompt: entry.prompt.clone(),
            backend: entry
                .backend
                .clone()
                .unwrap_or_else(|| parent.backend.clone()),
            priority: entry.priority.unwrap_or(parent.priority),
            acceptance_criteria: entry.acceptance_criteria.clone(),
            depends_on,
            pipeline_id: parent.pipeline_id.clone(),
            auto_review: parent.auto_review.clone().map(|j| j.0),
            parent_task_id: Some(parent.id.clone()),
            metadata: Some(serde_json::json!({
                "expanded_from": parent.id,
                "expand_index": i,
            })),
            ..Default::default()
        };

        let child = store::build_task(&input, ids::new_id());
        db::insert_task(&mut *tx, &child).await?;
        audit::append(
            &mut *tx,
            &NewAuditEntry {
                task_id: &child.id,
                action: "create",
                actor: None,
                before_state: None,
                after_state: Some("PENDING"),
                metadata: Some(serde_json::json!({
                    "expanded_from": parent.id,
                    "expand_index": i,
                })),
            },
        )
        .await?;
        children.push(child);
    }

    // Rewire: tasks in the same pipeline that depended on the parent now
    // depend on the terminal child(ren) instead.
    let terminal_ids: Vec<String> = if sequential {
        children.last().map(|c| vec![c.id.clone()]).unwrap_or_default()
    } else {
        children.iter().map(|c| c.id.clone()).collect()
    };

    if let Some(ref pipeline_id) = parent.pipeline_id {
        let rows: Vec<Task> = sqlx::query_as(
            "SELECT * FROM tasks WHERE pipeline_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(pipeline_id)
        .fetch_all(&mut *tx)
        .await
        .context("failed to list pipeline tasks")?;

        for mut downstream in rows {
            if downstream.id == parent.id || !downstream.depends_on.0.contains(&parent.id) {
                continue;
            }
            let mut deps: Vec<String> = downstream
                .depends_on
                .0
                .iter()
                .filter(|d| *d != &parent.id)
                .cloned()
                .collect();
            for t in &terminal_ids {
                if !deps.contains(t) {
                    deps.push(t.clone());
                }
            }
            downstream.depends_on = Json(deps);
            downstream.updated_at = chrono::Utc::now();
            db::update_task_row(&mut *tx, &downstream, downstream.status).await?;
            audit::append(
                &mut *tx,
                &NewAuditEntry {
                    task_id: &downstream.id,
                    action: "expand_rewire",
                    actor: None,
                    before_state: None,
                    after_state: None,
                    metadata: Some(serde_json::json!({
                        "replaced": parent.id,
                        "with": terminal_ids,
                    })),
                },
            )
            .await?;
        }

        super::recompute_steps(&mut tx, pipeline_id).await?;
    }

    audit::append(
        &mut *tx,
        &NewAuditEntry {
            task_id: &parent.id,
            action: "expand",
            actor: None,
            before_state: None,
            after_state: None,
            metadata: Some(serde_json::json!({
                "children": children.iter().map(|c| c.id.clone()).collect::<Vec<_>>(),
                "mode": if sequential { "sequential" } else { "parallel" },
            })),
        },
    )
    .await?;

    tx.commit().await.context("failed to commit transaction")?;
    Ok(children)
}
