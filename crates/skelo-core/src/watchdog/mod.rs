//! The watchdog: periodic recovery of IN_PROGRESS tasks whose lease has
//! expired or vanished.
//!
//! A lease past its expiry plus the grace period is recovered; a
//! lease-less IN_PROGRESS row is an anomaly recovered immediately. The
//! action is `requeue` unless the policy says `block` or the attempt
//! budget is spent. Errors from a tick are reported and the interval
//! continues.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use skelo_db::models::{Task, TaskStatus};
use skelo_db::queries::audit::{self, NewAuditEntry};
use skelo_db::queries::tasks as db;

use crate::dispatcher::OnError;
use crate::error::SkeloError;
use crate::state::{TaskStateMachine, TransitionContext};
use crate::webhook::{self, WebhookNotifier};

/// What to do with a task whose lease expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    #[default]
    Requeue,
    Block,
}

/// Watchdog configuration.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub interval: Duration,
    pub grace_period: Duration,
    pub on_lease_expire: RecoveryAction,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            grace_period: Duration::from_secs(120),
            on_lease_expire: RecoveryAction::Requeue,
        }
    }
}

/// The watchdog scheduler.
pub struct Watchdog {
    pool: SqlitePool,
    config: WatchdogConfig,
    notifier: Option<WebhookNotifier>,
    on_error: Option<OnError>,
}

impl Watchdog {
    pub fn new(
        pool: SqlitePool,
        config: WatchdogConfig,
        notifier: Option<WebhookNotifier>,
        on_error: Option<OnError>,
    ) -> Self {
        Self {
            pool,
            config,
            notifier,
            on_error,
        }
    }

    /// Run until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "watchdog started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("watchdog stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "watchdog error");
                        if let Some(ref hook) = self.on_error {
                            hook(&e);
                        }
                    }
                }
            }
        }
    }

    /// One recovery pass. Returns the number of tasks recovered.
    pub async fn tick(&self) -> Result<usize, SkeloError> {
        let in_progress = db::list_by_status(&self.pool, TaskStatus::InProgress).await?;
        let now = Utc::now();
        let grace = chrono::Duration::milliseconds(self.config.grace_period.as_millis() as i64);
        let mut recovered = 0;

        for task in in_progress {
            let missing_lease = task.lease_expires_at.is_none();
            if let Some(expires) = task.lease_expires_at {
                if expires + grace > now {
                    continue;
                }
            }
            // A lease-less IN_PROGRESS row violates the status/lease
            // coupling; recover it without grace.

            if let Err(e) = self.recover(&task, missing_lease).await {
                warn!(task_id = %task.id, error = %e, "failed to recover task");
                continue;
            }
            recovered += 1;
        }

        Ok(recovered)
    }

    async fn recover(&self, task: &Task, missing_lease: bool) -> Result<(), SkeloError> {
        let block = self.config.on_lease_expire == RecoveryAction::Block
            || task.attempt_count >= task.max_attempts;

        let (to, reason) = if block {
            (
                TaskStatus::Blocked,
                if task.attempt_count >= task.max_attempts {
                    format!(
                        "lease expired with attempt budget spent ({}/{})",
                        task.attempt_count, task.max_attempts
                    )
                } else {
                    "lease expired; recovery policy is block".to_owned()
                },
            )
        } else {
            (TaskStatus::Pending, "lease expired; requeued".to_owned())
        };

        let before = task.status;
        let updated = TaskStateMachine::transition(
            &self.pool,
            &task.id,
            to,
            &TransitionContext {
                reason: Some(reason.clone()),
                actor: Some("watchdog".to_owned()),
                ..Default::default()
            },
        )
        .await?;

        audit::append(
            &self.pool,
            &NewAuditEntry {
                task_id: &task.id,
                action: "watchdog_recovery",
                actor: Some("watchdog"),
                before_state: Some(&before.to_string()),
                after_state: Some(&updated.status.to_string()),
                metadata: Some(serde_json::json!({
                    "lease_expires_at": task.lease_expires_at,
                    "attempt_count": task.attempt_count,
                    "max_attempts": task.max_attempts,
                    "missing_lease": missing_lease,
                })),
            },
        )
        .await?;

        warn!(
            task_id = %task.id,
            after = %updated.status,
            missing_lease,
            "recovered stale in-progress task"
        );

        webhook::notify_status(&self.pool, self.notifier.as_ref(), &updated).await?;
        Ok(())
    }
}
