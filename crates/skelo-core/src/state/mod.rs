//! Task state machine.
//!
//! Validates and executes status transitions, enforcing the allowed
//! transition graph, lease bookkeeping, attempt and bounce budgets, and
//! feedback history. Every committed transition writes its audit entry in
//! the same transaction as the row update, with an optimistic
//! `WHERE status = from` lock serializing concurrent claims.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::SqlitePool;

use skelo_db::models::{Feedback, Task, TaskStatus};
use skelo_db::queries::audit::{self, NewAuditEntry};
use skelo_db::queries::tasks as db;

use crate::error::SkeloError;

/// Context accompanying a transition request. Which fields are required
/// depends on the edge; see [`TaskStateMachine::transition`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransitionContext {
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub last_error: Option<String>,
    pub feedback: Option<Feedback>,
    pub reason: Option<String>,
    pub actor: Option<String>,
    /// Set by the auto-review handler when a bounce closes a reject loop.
    #[serde(skip)]
    pub bump_loop_iteration: bool,
}

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// PENDING     -> IN_PROGRESS  (claim; lease required, attempt_count += 1)
/// IN_PROGRESS -> REVIEW       (result required; lease cleared)
/// IN_PROGRESS -> PENDING      (release; lease cleared)
/// IN_PROGRESS -> BLOCKED      (watchdog or manual; lease cleared)
/// REVIEW      -> DONE         (approve)
/// REVIEW      -> PENDING      (bounce; feedback required, bounce_count += 1)
/// REVIEW      -> BLOCKED      (manual)
/// PENDING     -> BLOCKED      (manual)
/// BLOCKED     -> PENDING      (manual requeue)
/// ```
///
/// Exhausting `max_attempts` on a claim, or `max_bounces` on a bounce,
/// forces the task to BLOCKED instead of the requested target.
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Pending, InProgress)
                | (InProgress, Review)
                | (InProgress, Pending)
                | (InProgress, Blocked)
                | (Review, Done)
                | (Review, Pending)
                | (Review, Blocked)
                | (Pending, Blocked)
                | (Blocked, Pending)
        )
    }

    /// Execute a transition and return the updated task.
    ///
    /// The returned task's status may be BLOCKED rather than `to` when a
    /// budget was exhausted; callers that care must inspect it.
    pub async fn transition(
        pool: &SqlitePool,
        task_id: &str,
        to: TaskStatus,
        ctx: &TransitionContext,
    ) -> Result<Task, SkeloError> {
        let mut tx = pool.begin().await.context("failed to begin transaction")?;

        let mut task = db::get_task(&mut *tx, task_id)
            .await?
            .ok_or_else(|| SkeloError::not_found(format!("task {task_id}")))?;
        let from = task.status;

        if !Self::is_valid_transition(from, to) {
            return Err(SkeloError::Transition {
                from,
                to,
                reason: "transition not in the permitted set".to_owned(),
            });
        }

        let mut audit_meta = serde_json::Map::new();
        let mut action = "transition";

        match (from, to) {
            (TaskStatus::Pending, TaskStatus::InProgress) => {
                let owner = ctx.lease_owner.clone().ok_or(SkeloError::Transition {
                    from,
                    to,
                    reason: "lease_owner is required to claim".to_owned(),
                })?;
                let expires = ctx.lease_expires_at.ok_or(SkeloError::Transition {
                    from,
                    to,
                    reason: "lease_expires_at is required to claim".to_owned(),
                })?;

                if task.attempt_count + 1 > task.max_attempts {
                    // Attempt budget exhausted: force BLOCKED instead.
                    task.status = TaskStatus::Blocked;
                    task.last_error = Some(format!(
                        "attempt budget exhausted ({}/{})",
                        task.attempt_count, task.max_attempts
                    ));
                    audit_meta.insert("attempt_budget_exhausted".into(), true.into());
                } else {
                    task.status = TaskStatus::InProgress;
                    task.lease_owner = Some(owner.clone());
                    task.lease_expires_at = Some(expires);
                    task.attempt_count += 1;
                    audit_meta.insert("lease_owner".into(), owner.into());
                }
            }
            (TaskStatus::InProgress, TaskStatus::Review) => {
                let result = ctx.result.clone().ok_or(SkeloError::Transition {
                    from,
                    to,
                    reason: "result is required to enter review".to_owned(),
                })?;
                task.status = TaskStatus::Review;
                task.result = Some(result);
                task.lease_owner = None;
                task.lease_expires_at = None;
            }
            (TaskStatus::InProgress, TaskStatus::Pending) => {
                action = "release";
                task.status = TaskStatus::Pending;
                task.lease_owner = None;
                task.lease_expires_at = None;
                if let Some(ref err) = ctx.last_error {
                    task.last_error = Some(err.clone());
                    audit_meta.insert("last_error".into(), err.clone().into());
                }
            }
            (TaskStatus::InProgress, TaskStatus::Blocked) => {
                task.status = TaskStatus::Blocked;
                task.lease_owner = None;
                task.lease_expires_at = None;
                if let Some(ref reason) = ctx.reason {
                    task.last_error = Some(reason.clone());
                }
            }
            (TaskStatus::Review, TaskStatus::Done) => {
                task.status = TaskStatus::Done;
            }
            (TaskStatus::Review, TaskStatus::Pending) => {
                let feedback = ctx.feedback.clone().ok_or(SkeloError::Transition {
                    from,
                    to,
                    reason: "feedback {what, where, fix} is required to bounce".to_owned(),
                })?;

                if task.bounce_count + 1 > task.max_bounces {
                    // Bounce budget exhausted: force BLOCKED instead.
                    task.status = TaskStatus::Blocked;
                    task.last_error = Some(format!(
                        "bounce budget exhausted ({}/{})",
                        task.bounce_count, task.max_bounces
                    ));
                    audit_meta.insert("bounce_budget_exhausted".into(), true.into());
                } else {
                    task.status = TaskStatus::Pending;
                    task.bounce_count += 1;
                    task.feedback_history.0.push(feedback.clone());
                    if ctx.bump_loop_iteration {
                        task.loop_iteration += 1;
                    }
                    audit_meta.insert(
                        "feedback".into(),
                        serde_json::to_value(&feedback).unwrap_or_default(),
                    );
                }
            }
            (TaskStatus::Review, TaskStatus::Blocked)
            | (TaskStatus::Pending, TaskStatus::Blocked) => {
                task.status = TaskStatus::Blocked;
                if let Some(ref reason) = ctx.reason {
                    task.last_error = Some(reason.clone());
                }
            }
            (TaskStatus::Blocked, TaskStatus::Pending) => {
                task.status = TaskStatus::Pending;
            }
            _ => unreachable!("validated above"),
        }

        if let Some(ref reason) = ctx.reason {
            audit_meta.insert("reason".into(), reason.clone().into());
        }

        task.updated_at = Utc::now();
        let rows = db::update_task_row(&mut *tx, &task, from).await?;
        if rows == 0 {
            // Concurrent transition won the race; the claim lock in action.
            return Err(SkeloError::Transition {
                from,
                to,
                reason: format!("task {task_id} changed concurrently"),
            });
        }

        let before = from.to_string();
        let after = task.status.to_string();
        audit::append(
            &mut *tx,
            &NewAuditEntry {
                task_id: &task.id,
                action,
                actor: ctx.actor.as_deref(),
                before_state: Some(&before),
                after_state: Some(&after),
                metadata: if audit_meta.is_empty() {
                    None
                } else {
                    Some(serde_json::Value::Object(audit_meta))
                },
            },
        )
        .await?;

        tx.commit().await.context("failed to commit transaction")?;
        Ok(task)
    }
}
