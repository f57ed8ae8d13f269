//! Task execution: hands tasks to workers, collects their completion
//! reports and enforces per-task deadlines.
//!
//! The coordinator only talks to the registry and to executors. It never
//! opens segment files; each worker owns exactly one segment writer.

use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::session::registry::{SessionRegistry, TaskId, TaskOutcome, TaskSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Bytes of worker stderr kept in a failure summary
const STDERR_TAIL: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Completed,
    Failed,
}

/// What a worker reports back when its task ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub task_id: TaskId,
    pub segment_path: PathBuf,
    pub record_count: u64,
    pub status: ReportStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CompletionReport {
    pub fn completed(task: &TaskSpec, record_count: u64) -> Self {
        Self {
            task_id: task.task_id,
            segment_path: task.segment_path.clone(),
            record_count,
            status: ReportStatus::Completed,
            error: None,
        }
    }

    pub fn failed(task: &TaskSpec, error: impl Into<String>) -> Self {
        Self {
            task_id: task.task_id,
            segment_path: task.segment_path.clone(),
            record_count: 0,
            status: ReportStatus::Failed,
            error: Some(error.into()),
        }
    }

    pub fn into_outcome(self) -> TaskOutcome {
        match self.status {
            ReportStatus::Completed => TaskOutcome::Completed {
                segment_path: self.segment_path,
                record_count: self.record_count,
            },
            ReportStatus::Failed => TaskOutcome::Failed {
                error: self.error.unwrap_or_else(|| "worker reported failure".into()),
            },
        }
    }
}

/// Runs one task to completion somewhere: another process, a thread, a test double
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    async fn execute(&self, task: &TaskSpec) -> Result<CompletionReport>;
}

/// Runs each task as a `worker` subprocess of a store binary.
///
/// The worker prints its [`CompletionReport`] as one JSON line on stdout.
/// A dropped execution (deadline passed) kills the child, leaving its
/// segment unsealed.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: PathBuf,
    config_path: Option<PathBuf>,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config_path: None,
        }
    }

    /// Spawn workers from the running executable
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Pass a config file through to every worker
    pub fn with_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    fn command(&self, task: &TaskSpec) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(config) = &self.config_path {
            cmd.arg("--config").arg(config);
        }
        cmd.arg("worker")
            .arg("--task-id")
            .arg(task.task_id.to_string())
            .arg("--input")
            .arg(&task.input)
            .arg("--segment")
            .arg(&task.segment_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl TaskExecutor for ProcessExecutor {
    async fn execute(&self, task: &TaskSpec) -> Result<CompletionReport> {
        debug!(task = %task.task_id, program = %self.program.display(), "Spawning worker");
        let output = self
            .command(task)
            .output()
            .await
            .map_err(|e| Error::Coordinator(format!("cannot spawn worker: {}", e)))?;

        if !output.status.success() {
            return Ok(CompletionReport::failed(
                task,
                format!("worker exited with {}: {}", output.status, stderr_tail(&output.stderr)),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| Error::Coordinator("worker printed no completion report".into()))?;
        let report: CompletionReport = serde_json::from_str(line)
            .map_err(|e| Error::Coordinator(format!("bad completion report: {}", e)))?;
        Ok(report)
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

/// Runs tasks in this process on the blocking thread pool.
///
/// A deadline stops waiting for the task but cannot interrupt the closure.
pub struct InProcessExecutor<F> {
    work: Arc<F>,
}

impl<F> InProcessExecutor<F>
where
    F: Fn(&TaskSpec) -> Result<CompletionReport> + Send + Sync + 'static,
{
    pub fn new(work: F) -> Self {
        Self {
            work: Arc::new(work),
        }
    }
}

#[async_trait]
impl<F> TaskExecutor for InProcessExecutor<F>
where
    F: Fn(&TaskSpec) -> Result<CompletionReport> + Send + Sync + 'static,
{
    async fn execute(&self, task: &TaskSpec) -> Result<CompletionReport> {
        let work = self.work.clone();
        let task = task.clone();
        tokio::task::spawn_blocking(move || work(&task)).await?
    }
}

/// Totals of one coordinator run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub records: u64,
}

/// Drives a session's pending tasks through an executor
pub struct Coordinator {
    max_workers: usize,
    task_timeout: Duration,
}

impl Coordinator {
    pub fn new(config: &CoordinatorConfig) -> Self {
        Self {
            max_workers: config.max_workers.max(1),
            task_timeout: config.task_timeout(),
        }
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Run every pending task, at most `max_workers` at a time, and record
    /// each outcome in the registry.
    #[instrument(skip_all, fields(max_workers = self.max_workers))]
    pub async fn run(
        &self,
        registry: &SessionRegistry,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<RunSummary> {
        let pending = registry.pending_tasks()?;
        info!(tasks = pending.len(), "Starting tasks");

        let launched: Vec<TaskId> = pending.iter().map(|t| t.task_id).collect();
        let permits = Arc::new(Semaphore::new(self.max_workers));
        let mut running = JoinSet::new();
        for task in pending {
            let permits = permits.clone();
            let registry = registry.clone();
            let executor = executor.clone();
            let deadline = self.task_timeout;
            running.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Coordinator(e.to_string()))?;
                registry.mark_running(task.task_id)?;
                let outcome = run_one(executor.as_ref(), &task, deadline).await;
                registry.report_task_result(task.task_id, outcome.clone())?;
                Ok::<_, Error>(outcome)
            });
        }

        // Drain every task even after an error.
        let mut summary = RunSummary::default();
        let mut first_error: Option<Error> = None;
        while let Some(joined) = running.join_next().await {
            let outcome = match joined {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    error!(error = %e, "Could not record task outcome");
                    first_error.get_or_insert(e);
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Task supervisor failed");
                    first_error.get_or_insert(Error::Coordinator(e.to_string()));
                    continue;
                }
            };
            match outcome {
                TaskOutcome::Completed { record_count, .. } => {
                    summary.completed += 1;
                    summary.records += record_count;
                }
                TaskOutcome::Failed { .. } => summary.failed += 1,
                TaskOutcome::TimedOut => summary.timed_out += 1,
            }
        }

        if let Some(e) = first_error {
            fail_unfinished(registry, &launched, &e);
            return Err(e);
        }

        info!(
            completed = summary.completed,
            failed = summary.failed,
            timed_out = summary.timed_out,
            records = summary.records,
            "Tasks finished"
        );
        Ok(summary)
    }
}

/// After a failed run, no launched task may stay pending or running.
fn fail_unfinished(registry: &SessionRegistry, launched: &[TaskId], cause: &Error) {
    for &task_id in launched {
        let unfinished = matches!(registry.task(task_id), Ok(Some(record)) if !record.state.is_terminal());
        if !unfinished {
            continue;
        }
        let outcome = TaskOutcome::Failed {
            error: format!("coordinator stopped: {}", cause),
        };
        if let Err(e) = registry.report_task_result(task_id, outcome) {
            warn!(task = %task_id, error = %e, "Could not mark unfinished task failed");
        }
    }
    if let Err(e) = registry.persist() {
        warn!(error = %e, "Could not persist session manifest after failed run");
    }
}

async fn run_one(executor: &dyn TaskExecutor, task: &TaskSpec, deadline: Duration) -> TaskOutcome {
    match tokio::time::timeout(deadline, executor.execute(task)).await {
        Ok(Ok(report)) if report.task_id != task.task_id => TaskOutcome::Failed {
            error: format!("worker reported task {} for task {}", report.task_id, task.task_id),
        },
        Ok(Ok(report)) => report.into_outcome(),
        Ok(Err(e)) => TaskOutcome::Failed {
            error: e.to_string(),
        },
        Err(_) => {
            warn!(task = %task.task_id, deadline_ms = deadline.as_millis() as u64, "Task deadline exceeded");
            TaskOutcome::TimedOut
        }
    }
}
