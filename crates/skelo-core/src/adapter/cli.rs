//! CLI adapter: executes tasks by spawning a configured command.
//!
//! The rendered task prompt is written to the child's stdin; stdout is the
//! task result. Timeouts deliver SIGTERM, then SIGKILL after a short
//! grace, and report exit code 124.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{render_prompt, Adapter, AdapterResult, TaskInput, TIMEOUT_EXIT_CODE};

/// How long a SIGTERM'd process gets before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Static configuration for a [`CliAdapter`].
#[derive(Debug, Clone)]
pub struct CliAdapterConfig {
    pub name: String,
    pub task_types: Vec<String>,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Default execution budget; `backend_config.timeout_ms` overrides.
    pub timeout: Duration,
}

/// Adapter that runs each task as a child process.
pub struct CliAdapter {
    config: CliAdapterConfig,
    /// In-flight process ids keyed by task id, for abort.
    running: Arc<Mutex<HashMap<String, u32>>>,
}

impl CliAdapter {
    pub fn new(config: CliAdapterConfig) -> Self {
        Self {
            config,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

fn terminate(pid: u32) {
    #[cfg(unix)]
    {
        // SIGTERM first so the process can clean up; the caller escalates.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

#[async_trait]
impl Adapter for CliAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn task_types(&self) -> &[String] {
        &self.config.task_types
    }

    async fn execute(&self, input: &TaskInput) -> Result<AdapterResult> {
        let start = Instant::now();

        let command = input
            .backend_config
            .command
            .clone()
            .unwrap_or_else(|| self.config.command.clone());
        let args = if input.backend_config.args.is_empty() {
            self.config.args.clone()
        } else {
            input.backend_config.args.clone()
        };
        let timeout = input
            .backend_config
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.timeout);

        let mut cmd = Command::new(&command);
        cmd.args(&args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        if let Some(cwd) = input
            .backend_config
            .cwd
            .clone()
            .map(PathBuf::from)
            .or_else(|| self.config.cwd.clone())
        {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        for (key, value) in &input.backend_config.env {
            cmd.env(key, value);
        }
        cmd.env("SKELO_TASK_ID", &input.id);
        if let Some(ref model) = input.backend_config.model {
            cmd.env("SKELO_MODEL", model);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn backend command {command:?}"))?;

        let pid = child.id().context("child process has no pid")?;
        self.running
            .lock()
            .await
            .insert(input.id.clone(), pid);

        // Write the rendered prompt to stdin, then close it so the command
        // starts processing.
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = render_prompt(input);
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                warn!(task_id = %input.id, error = %e, "failed to write prompt to stdin");
            }
            drop(stdin);
        }

        // Read stdout/stderr concurrently with waiting so a chatty child
        // cannot deadlock on a full pipe buffer.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let read_stdout = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stdout_pipe {
                pipe.read_to_end(&mut buf).await.ok();
            }
            String::from_utf8_lossy(&buf).into_owned()
        };
        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stderr_pipe {
                pipe.read_to_end(&mut buf).await.ok();
            }
            String::from_utf8_lossy(&buf).into_owned()
        };

        let outcome = tokio::time::timeout(timeout, async {
            let (wait_result, stdout, stderr) =
                tokio::join!(child.wait(), read_stdout, read_stderr);
            (wait_result, stdout, stderr)
        })
        .await;

        self.running.lock().await.remove(&input.id);

        match outcome {
            Ok((Ok(status), stdout, stderr)) => {
                let exit_code = status.code().unwrap_or(-1);
                let duration_ms = start.elapsed().as_millis() as u64;
                debug!(task_id = %input.id, exit_code, duration_ms, "backend command finished");

                let output = if exit_code == 0 { stdout } else { stderr };
                let structured = serde_json::from_str(&output).ok();
                Ok(AdapterResult {
                    output,
                    exit_code,
                    duration_ms,
                    structured,
                })
            }
            Ok((Err(e), _, _)) => {
                Err(e).with_context(|| format!("failed to wait on backend command {command:?}"))
            }
            Err(_) => {
                terminate(pid);
                let killed =
                    tokio::time::timeout(KILL_GRACE, child.wait()).await;
                if killed.is_err() {
                    let _ = child.kill().await;
                }
                warn!(task_id = %input.id, timeout_ms = timeout.as_millis() as u64, "backend command timed out");
                Ok(AdapterResult {
                    output: format!(
                        "backend command timed out after {}ms",
                        timeout.as_millis()
                    ),
                    exit_code: TIMEOUT_EXIT_CODE,
                    duration_ms: start.elapsed().as_millis() as u64,
                    structured: None,
                })
            }
        }
    }

    async fn abort(&self, task_id: &str) -> Result<()> {
        if let Some(pid) = self.running.lock().await.get(task_id).copied() {
            debug!(task_id, pid, "aborting backend command");
            terminate(pid);
        }
        Ok(())
    }
}
