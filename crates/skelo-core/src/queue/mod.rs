//! Priority queue over pending tasks.
//!
//! Ordering is fully determined by the row data: `priority ASC`, ranked
//! rows before unranked, `manual_rank ASC`, `created_at ASC`, and the ULID
//! `id` as the stable final tiebreaker. Held tasks never surface.

use anyhow::Context;
use serde::Deserialize;
use sqlx::SqlitePool;

use skelo_db::models::Task;
use skelo_db::queries::audit::{self, NewAuditEntry};
use skelo_db::queries::tasks as db;

use crate::error::SkeloError;
use crate::pipeline;

/// Filters for [`get_next`].
#[derive(Debug, Clone, Default)]
pub struct NextFilter {
    pub task_type: Option<String>,
    pub exclude_ids: Vec<String>,
}

/// Target position for [`reorder`].
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Position {
    Top { top: bool },
    Before { before: String },
    After { after: String },
}

/// Return the next claimable PENDING task, or `None` when the queue is
/// empty. Does not check dependency readiness; the dispatcher and the
/// claim endpoint layer that on via [`pipeline::dependencies_met`].
pub async fn get_next(
    pool: &SqlitePool,
    filter: &NextFilter,
) -> Result<Option<Task>, SkeloError> {
    let pending = db::list_pending_ordered(pool, filter.task_type.as_deref()).await?;
    Ok(pending
        .into_iter()
        .find(|t| !filter.exclude_ids.contains(&t.id)))
}

/// Return the next claimable task whose dependencies are all DONE.
pub async fn get_next_ready(
    pool: &SqlitePool,
    filter: &NextFilter,
) -> Result<Option<Task>, SkeloError> {
    let pending = db::list_pending_ordered(pool, filter.task_type.as_deref()).await?;
    for task in pending {
        if filter.exclude_ids.contains(&task.id) {
            continue;
        }
        if pipeline::dependencies_met(pool, &task).await? {
            return Ok(Some(task));
        }
    }
    Ok(None)
}

/// Move a pending task to an explicit position in the queue.
///
/// The whole pending ordering is materialized, the subject re-inserted at
/// the computed index, and a dense `manual_rank = index` written back for
/// every row, all in one transaction. Ranks therefore stay unique and the
/// ordering stays stable under concurrent `get_next` calls.
pub async fn reorder(
    pool: &SqlitePool,
    task_id: &str,
    position: &Position,
) -> Result<(), SkeloError> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let task = db::get_task(&mut *tx, task_id)
        .await?
        .ok_or_else(|| SkeloError::not_found(format!("task {task_id}")))?;

    let pending = db::list_pending_ordered(&mut *tx, None).await?;
    let mut ids: Vec<String> = pending.into_iter().map(|t| t.id).collect();
    if !ids.contains(&task.id) {
        return Err(SkeloError::validation(format!(
            "task {task_id} is not in the pending queue"
        )));
    }
    ids.retain(|id| id != task_id);

    let index = match position {
        Position::Top { .. } => 0,
        Position::Before { before } => ids
            .iter()
            .position(|id| id == before)
            .ok_or_else(|| SkeloError::not_found(format!("task {before}")))?,
        Position::After { after } => {
            let pos = ids
                .iter()
                .position(|id| id == after)
                .ok_or_else(|| SkeloError::not_found(format!("task {after}")))?;
            pos + 1
        }
    };
    ids.insert(index.min(ids.len()), task_id.to_owned());

    for (i, id) in ids.iter().enumerate() {
        db::set_manual_rank(&mut *tx, id, Some(i as f64)).await?;
    }

    audit::append(
        &mut *tx,
        &NewAuditEntry {
            task_id,
            action: "reorder",
            actor: None,
            before_state: None,
            after_state: None,
            metadata: Some(serde_json::json!({ "position": index })),
        },
    )
    .await?;

    tx.commit().await.context("failed to commit transaction")?;
    Ok(())
}
