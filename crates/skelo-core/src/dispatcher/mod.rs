//! The dispatcher: claims eligible pending tasks and runs them through
//! adapters under a lease.
//!
//! Each tick walks the configured adapters in order, checks WIP limits,
//! selects the highest-priority claimable task for each, claims it through
//! the state machine (which serializes concurrent claims), and spawns a
//! worker owning the adapter call and its heartbeat. Workers post
//! completions to an mpsc channel; the dispatcher loop finalizes them —
//! gate evaluation, the REVIEW or PENDING transition, and the expansion
//! and auto-review handlers. Errors from a tick are reported and the loop
//! continues.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skelo_db::models::{GateSpec, Task, TaskStatus};
use skelo_db::queries::audit::{self, NewAuditEntry};
use skelo_db::queries::tasks as db;

use crate::adapter::{adapter_name, build_task_input, Adapter, AdapterResult, TaskInput};
use crate::error::SkeloError;
use crate::gate::{self, GateData};
use crate::pipeline;
use crate::review;
use crate::state::{TaskStateMachine, TransitionContext};
use crate::webhook::{self, WebhookNotifier};

/// Callback invoked when a tick or finalization fails.
pub type OnError = Arc<dyn Fn(&SkeloError) + Send + Sync>;

/// Per-type concurrency caps.
#[derive(Debug, Clone)]
pub struct WipLimits {
    pub per_type: HashMap<String, usize>,
    pub default_limit: usize,
}

impl Default for WipLimits {
    fn default() -> Self {
        Self {
            per_type: HashMap::new(),
            default_limit: 1,
        }
    }
}

impl WipLimits {
    pub fn limit_for(&self, task_type: &str) -> usize {
        self.per_type
            .get(task_type)
            .copied()
            .unwrap_or(self.default_limit)
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub lease_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub wip_limits: WipLimits,
    /// Default gates merged in per task type at finalization.
    pub default_gates: HashMap<String, Vec<GateSpec>>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(60),
            wip_limits: WipLimits::default(),
            default_gates: HashMap::new(),
        }
    }
}

/// Message posted by a worker when its adapter call finishes.
struct ExecutionDone {
    task_id: String,
    adapter: String,
    result: Result<AdapterResult>,
}

/// The dispatcher. Shares no mutable state with the watchdog or the HTTP
/// server beyond the store itself.
pub struct Dispatcher {
    pool: SqlitePool,
    config: DispatcherConfig,
    adapters: Vec<Arc<dyn Adapter>>,
    notifier: Option<WebhookNotifier>,
    on_error: Option<OnError>,
    /// Adapter handling each in-flight task, for abort routing.
    in_flight: Arc<Mutex<HashMap<String, Arc<dyn Adapter>>>>,
}

impl Dispatcher {
    pub fn new(
        pool: SqlitePool,
        config: DispatcherConfig,
        adapters: Vec<Arc<dyn Adapter>>,
        notifier: Option<WebhookNotifier>,
        on_error: Option<OnError>,
    ) -> Self {
        Self {
            pool,
            config,
            adapters,
            notifier,
            on_error,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn report(&self, err: &SkeloError) {
        tracing::error!(error = %err, "dispatcher error");
        if let Some(ref hook) = self.on_error {
            hook(err);
        }
    }

    /// Run until cancelled. One tick per poll interval; completions are
    /// finalized as they arrive.
    pub async fn run(&self, cancel: CancellationToken) {
        let (tx, mut rx) = mpsc::channel::<ExecutionDone>(64);
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            adapters = self.adapters.len(),
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "dispatcher started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("dispatcher stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick_inner(&tx).await {
                        self.report(&e);
                    }
                }
                Some(done) = rx.recv() => {
                    if let Err(e) = self.finalize(done).await {
                        self.report(&e);
                    }
                }
            }
        }
    }

    /// One standalone scheduling pass that also waits for and finalizes
    /// every execution it claimed. Used by tests and one-shot runs; the
    /// long-running loop uses the channel-driven path instead.
    pub async fn tick_once(&self) -> Result<usize, SkeloError> {
        let (tx, mut rx) = mpsc::channel::<ExecutionDone>(64);
        let claimed = self.tick_inner(&tx).await?;
        drop(tx);
        while let Some(done) = rx.recv().await {
            self.finalize(done).await?;
        }
        Ok(claimed)
    }

    async fn tick_inner(&self, tx: &mpsc::Sender<ExecutionDone>) -> Result<usize, SkeloError> {
        let mut claimed_ids: Vec<String> = Vec::new();

        for adapter in &self.adapters {
            if self.is_saturated(adapter.as_ref()).await? {
                continue;
            }

            let Some(task) = self.find_candidate(adapter.as_ref(), &claimed_ids).await? else {
                continue;
            };

            let lease_expires = Utc::now()
                + chrono::Duration::milliseconds(self.config.lease_ttl.as_millis() as i64);
            let claimed = match TaskStateMachine::transition(
                &self.pool,
                &task.id,
                TaskStatus::InProgress,
                &TransitionContext {
                    lease_owner: Some(adapter.name().to_owned()),
                    lease_expires_at: Some(lease_expires),
                    actor: Some("dispatcher".to_owned()),
                    ..Default::default()
                },
            )
            .await
            {
                Ok(t) if t.status == TaskStatus::InProgress => t,
                Ok(t) => {
                    // Claim forced the task to BLOCKED (attempt budget).
                    webhook::notify_status(&self.pool, self.notifier.as_ref(), &t).await?;
                    continue;
                }
                Err(SkeloError::Transition { reason, .. }) => {
                    debug!(task_id = %task.id, reason, "lost claim race");
                    continue;
                }
                Err(e) => return Err(e),
            };
            claimed_ids.push(claimed.id.clone());

            audit::append(
                &self.pool,
                &NewAuditEntry {
                    task_id: &claimed.id,
                    action: "dispatch",
                    actor: Some(adapter.name()),
                    before_state: None,
                    after_state: None,
                    metadata: Some(serde_json::json!({
                        "adapter": adapter.name(),
                        "attempt": claimed.attempt_count,
                    })),
                },
            )
            .await?;

            let upstream = pipeline::upstream_results(&self.pool, &claimed).await?;
            let input = build_task_input(&claimed, upstream);

            self.in_flight
                .lock()
                .await
                .insert(claimed.id.clone(), Arc::clone(adapter));

            self.spawn_worker(Arc::clone(adapter), input, tx.clone());
        }

        Ok(claimed_ids.len())
    }

    /// Whether any task type served by the adapter is at its WIP limit.
    async fn is_saturated(&self, adapter: &dyn Adapter) -> Result<bool, SkeloError> {
        for task_type in adapter.task_types() {
            let count = db::count_in_progress_of_type(&self.pool, task_type).await?;
            if count as usize >= self.config.wip_limits.limit_for(task_type) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Highest-priority claimable task for this adapter: queue order,
    /// dependencies DONE, backend routed to this adapter, not claimed in
    /// this tick.
    async fn find_candidate(
        &self,
        adapter: &dyn Adapter,
        exclude: &[String],
    ) -> Result<Option<Task>, SkeloError> {
        for task_type in adapter.task_types() {
            let pending = db::list_pending_ordered(&self.pool, Some(task_type.as_str())).await?;
            for task in pending {
                if exclude.contains(&task.id) {
                    continue;
                }
                if adapter_name(&task.backend) != adapter.name() {
                    continue;
                }
                if !pipeline::dependencies_met(&self.pool, &task).await? {
                    continue;
                }
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    /// Spawn the worker owning the adapter call and its heartbeat.
    fn spawn_worker(
        &self,
        adapter: Arc<dyn Adapter>,
        input: TaskInput,
        tx: mpsc::Sender<ExecutionDone>,
    ) {
        let pool = self.pool.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let lease_ttl = self.config.lease_ttl;

        tokio::spawn(async move {
            let hb_cancel = CancellationToken::new();
            let hb = tokio::spawn(heartbeat_loop(
                pool,
                input.id.clone(),
                heartbeat_interval,
                lease_ttl,
                hb_cancel.clone(),
            ));

            let result = adapter.execute(&input).await;

            hb_cancel.cancel();
            let _ = hb.await;
            let _ = tx
                .send(ExecutionDone {
                    task_id: input.id,
                    adapter: adapter.name().to_owned(),
                    result,
                })
                .await;
        });
    }

    /// Finalize a completed execution: run gates, advance the state
    /// machine, and invoke the expansion and auto-review handlers.
    async fn finalize(&self, done: ExecutionDone) -> Result<(), SkeloError> {
        self.in_flight.lock().await.remove(&done.task_id);

        let Some(task) = db::get_task(&self.pool, &done.task_id).await? else {
            warn!(task_id = %done.task_id, "finalized task no longer exists");
            return Ok(());
        };
        if task.status != TaskStatus::InProgress {
            // Watchdog recovery or an abort got here first.
            debug!(task_id = %task.id, status = %task.status, "task already finalized");
            return Ok(());
        }

        match done.result {
            Ok(res) if res.exit_code == 0 => {
                self.finalize_success(&task, &done.adapter, res).await
            }
            Ok(res) => {
                self.release(
                    &task,
                    &done.adapter,
                    format!("adapter exited with code {}: {}", res.exit_code, res.output),
                )
                .await
            }
            Err(e) => {
                self.release(&task, &done.adapter, format!("adapter error: {e:#}")).await
            }
        }
    }

    async fn finalize_success(
        &self,
        task: &Task,
        adapter: &str,
        res: AdapterResult,
    ) -> Result<(), SkeloError> {
        let mut specs: Vec<GateSpec> = task.gates.0.clone();
        if let Some(defaults) = self.config.default_gates.get(&task.task_type) {
            specs.extend(defaults.iter().cloned());
        }

        let data = GateData::auto(&res.output);
        let (results, passed) = gate::run_specs(&specs, &data);

        if !passed {
            let failing: Vec<String> = results
                .iter()
                .filter(|r| !r.passed)
                .map(|r| {
                    format!("{}: {}", r.gate, r.reason.as_deref().unwrap_or("failed"))
                })
                .collect();
            audit::append(
                &self.pool,
                &NewAuditEntry {
                    task_id: &task.id,
                    action: "gate_failed",
                    actor: Some(adapter),
                    before_state: None,
                    after_state: None,
                    metadata: Some(serde_json::json!({ "results": results })),
                },
            )
            .await?;
            return self
                .release(task, adapter, format!("gate failed: {}", failing.join("; ")))
                .await;
        }

        let updated = match TaskStateMachine::transition(
            &self.pool,
            &task.id,
            TaskStatus::Review,
            &TransitionContext {
                result: Some(res.output.clone()),
                actor: Some(adapter.to_owned()),
                ..Default::default()
            },
        )
        .await
        {
            Ok(t) => t,
            Err(SkeloError::Transition { reason, .. }) => {
                debug!(task_id = %task.id, reason, "lost finalize race");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        audit::append(
            &self.pool,
            &NewAuditEntry {
                task_id: &updated.id,
                action: "execution_complete",
                actor: Some(adapter),
                before_state: None,
                after_state: None,
                metadata: Some(serde_json::json!({
                    "exit_code": res.exit_code,
                    "duration_ms": res.duration_ms,
                })),
            },
        )
        .await?;

        webhook::notify_status(&self.pool, self.notifier.as_ref(), &updated).await?;

        if updated.is_expand() {
            if let Err(e) = pipeline::expand::run_expansion(&self.pool, &updated).await {
                warn!(task_id = %updated.id, error = %e, "expansion failed");
            }
        }
        review::handle_review_entry(&self.pool, self.notifier.as_ref(), &updated).await?;

        Ok(())
    }

    async fn release(
        &self,
        task: &Task,
        adapter: &str,
        last_error: String,
    ) -> Result<(), SkeloError> {
        match TaskStateMachine::transition(
            &self.pool,
            &task.id,
            TaskStatus::Pending,
            &TransitionContext {
                last_error: Some(last_error),
                actor: Some(adapter.to_owned()),
                ..Default::default()
            },
        )
        .await
        {
            Ok(_) => Ok(()),
            Err(SkeloError::Transition { reason, .. }) => {
                debug!(task_id = %task.id, reason, "lost release race");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Cooperatively cancel an in-flight execution and release the task.
    pub async fn abort(&self, task_id: &str) -> Result<(), SkeloError> {
        if let Some(adapter) = self.in_flight.lock().await.get(task_id).cloned() {
            if let Err(e) = adapter.abort(task_id).await {
                warn!(task_id, error = %e, "adapter abort failed");
            }
        }

        let task = db::get_task(&self.pool, task_id)
            .await?
            .ok_or_else(|| SkeloError::not_found(format!("task {task_id}")))?;
        self.release(&task, "dispatcher", "execution cancelled".to_owned())
            .await
    }
}

/// Periodically extend an in-progress task's lease. Stops when cancelled
/// or when the task leaves IN_PROGRESS.
async fn heartbeat_loop(
    pool: SqlitePool,
    task_id: String,
    every: Duration,
    lease_ttl: Duration,
    cancel: CancellationToken,
) {
    let start = tokio::time::Instant::now() + every;
    let mut interval = tokio::time::interval_at(start, every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let expires = Utc::now()
                    + chrono::Duration::milliseconds(lease_ttl.as_millis() as i64);
                match db::update_lease_expiry(&pool, &task_id, expires).await {
                    Ok(0) => {
                        // No longer in progress; nothing left to extend.
                        break;
                    }
                    Ok(_) => {
                        let entry = NewAuditEntry {
                            task_id: &task_id,
                            action: "heartbeat",
                            actor: None,
                            before_state: None,
                            after_state: None,
                            metadata: None,
                        };
                        if let Err(e) = audit::append(&pool, &entry).await {
                            warn!(task_id = %task_id, error = %e, "failed to record heartbeat");
                        }
                    }
                    Err(e) => {
                        // Best-effort: the lease expires naturally if this
                        // keeps failing.
                        warn!(task_id = %task_id, error = %e, "heartbeat failed");
                    }
                }
            }
        }
    }
}
