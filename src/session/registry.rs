//! Per-session task bookkeeping and the on-disk session manifest

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Manifest file name inside a session directory
pub const MANIFEST_FILE: &str = "session.json";

/// Directory holding a session's segment files
pub const SEGMENTS_DIR: &str = "segments";

/// Sequential task identifier, unique within one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work handed to one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: TaskId,
    /// What the worker should process (e.g. an input file)
    pub input: String,
    /// Segment the worker owns for this task
    pub segment_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed { segment_path: PathBuf, record_count: u64 },
    Failed { error: String },
    TimedOut,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed { .. } | TaskState::Failed { .. } | TaskState::TimedOut
        )
    }

    fn name(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed { .. } => "completed",
            TaskState::Failed { .. } => "failed",
            TaskState::TimedOut => "timed_out",
        }
    }
}

/// Terminal result of a task, as reported to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { segment_path: PathBuf, record_count: u64 },
    Failed { error: String },
    TimedOut,
}

impl From<TaskOutcome> for TaskState {
    fn from(outcome: TaskOutcome) -> Self {
        match outcome {
            TaskOutcome::Completed {
                segment_path,
                record_count,
            } => TaskState::Completed {
                segment_path,
                record_count,
            },
            TaskOutcome::Failed { error } => TaskState::Failed { error },
            TaskOutcome::TimedOut => TaskState::TimedOut,
        }
    }
}

/// Lifecycle of the segment a task produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentLifecycle {
    Open,
    Sealed,
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Merged,
}

/// A task and everything known about it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub spec: TaskSpec,
    pub state: TaskState,
    pub segment: Option<SegmentLifecycle>,
    pub updated_at: DateTime<Utc>,
}

/// Contents of `session.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionManifest {
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    next_task_id: u64,
    pub tasks: Vec<TaskRecord>,
}

/// Short description of a session found on disk
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub tasks: usize,
    pub completed: usize,
}

struct RegistryInner {
    dir: PathBuf,
    manifest: SessionManifest,
}

impl RegistryInner {
    fn task_mut(&mut self, task_id: TaskId) -> Result<&mut TaskRecord> {
        self.manifest
            .tasks
            .iter_mut()
            .find(|t| t.spec.task_id == task_id)
            .ok_or_else(|| Error::Registry(format!("unknown task {}", task_id)))
    }

    fn pending_count(&self) -> usize {
        self.manifest
            .tasks
            .iter()
            .filter(|t| !t.state.is_terminal())
            .count()
    }

    /// Write the manifest to a temp file and rename it into place
    fn persist(&self) -> Result<()> {
        let path = self.dir.join(MANIFEST_FILE);
        let tmp = self.dir.join(format!("{}.tmp", MANIFEST_FILE));
        let bytes = serde_json::to_vec_pretty(&self.manifest)?;
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Handle on one processing session's task registry.
///
/// Cloning shares the same registry. Every state change is persisted to the
/// session manifest before the call returns.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl SessionRegistry {
    /// Start a new session in `dir`
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::create_with_id(dir, Uuid::new_v4())
    }

    pub fn create_with_id<P: AsRef<Path>>(dir: P, session_id: Uuid) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if dir.join(MANIFEST_FILE).exists() {
            return Err(Error::Registry(format!(
                "session already exists at {}",
                dir.display()
            )));
        }
        std::fs::create_dir_all(dir.join(SEGMENTS_DIR))?;

        let manifest = SessionManifest {
            session_id,
            created_at: Utc::now(),
            status: SessionStatus::Active,
            next_task_id: 0,
            tasks: Vec::new(),
        };
        let inner = RegistryInner { dir, manifest };
        inner.persist()?;
        info!(session = %inner.manifest.session_id, dir = %inner.dir.display(), "Created session");

        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
        })
    }

    /// Reload a session from its manifest
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let manifest = read_manifest(&dir)?;
        debug!(session = %manifest.session_id, tasks = manifest.tasks.len(), "Opened session");
        Ok(Self {
            inner: Arc::new(RwLock::new(RegistryInner { dir, manifest })),
        })
    }

    /// Re-read the manifest from disk, picking up changes made by another process
    pub fn reload(&self) -> Result<()> {
        let mut inner = self.inner.write()?;
        let manifest = read_manifest(&inner.dir)?;
        inner.manifest = manifest;
        Ok(())
    }

    pub fn session_id(&self) -> Result<Uuid> {
        Ok(self.inner.read()?.manifest.session_id)
    }

    pub fn dir(&self) -> Result<PathBuf> {
        Ok(self.inner.read()?.dir.clone())
    }

    pub fn status(&self) -> Result<SessionStatus> {
        Ok(self.inner.read()?.manifest.status)
    }

    /// Write the current state to the manifest again, e.g. after an
    /// earlier write failed
    pub fn persist(&self) -> Result<()> {
        self.inner.read()?.persist()
    }

    /// Snapshot of the manifest
    pub fn manifest(&self) -> Result<SessionManifest> {
        Ok(self.inner.read()?.manifest.clone())
    }

    /// Add a task; its segment lives at `<session>/segments/task-<id>.seg`
    pub fn register_task(&self, input: impl Into<String>) -> Result<TaskSpec> {
        let mut inner = self.inner.write()?;
        if inner.manifest.status != SessionStatus::Active {
            return Err(Error::Registry(format!(
                "session {} is no longer accepting tasks",
                inner.manifest.session_id
            )));
        }

        let task_id = TaskId(inner.manifest.next_task_id);
        inner.manifest.next_task_id += 1;
        let spec = TaskSpec {
            task_id,
            input: input.into(),
            segment_path: inner
                .dir
                .join(SEGMENTS_DIR)
                .join(format!("task-{}.seg", task_id)),
        };
        inner.manifest.tasks.push(TaskRecord {
            spec: spec.clone(),
            state: TaskState::Pending,
            segment: None,
            updated_at: Utc::now(),
        });
        inner.persist()?;
        debug!(task = %task_id, input = %spec.input, "Registered task");
        Ok(spec)
    }

    pub fn mark_running(&self, task_id: TaskId) -> Result<()> {
        let mut inner = self.inner.write()?;
        let task = inner.task_mut(task_id)?;
        if task.state != TaskState::Pending {
            return Err(Error::Registry(format!(
                "task {} cannot start from state {}",
                task_id,
                task.state.name()
            )));
        }
        task.state = TaskState::Running;
        task.segment = Some(SegmentLifecycle::Open);
        task.updated_at = Utc::now();
        inner.persist()
    }

    /// Record a task's terminal outcome. Terminal states are final.
    pub fn report_task_result(&self, task_id: TaskId, outcome: TaskOutcome) -> Result<()> {
        let mut inner = self.inner.write()?;
        let task = inner.task_mut(task_id)?;
        if task.state.is_terminal() {
            return Err(Error::Registry(format!(
                "task {} already {}",
                task_id,
                task.state.name()
            )));
        }

        let state = TaskState::from(outcome);
        task.segment = match &state {
            TaskState::Completed { .. } => Some(SegmentLifecycle::Sealed),
            _ if task.spec.segment_path.exists() => Some(SegmentLifecycle::Open),
            _ => None,
        };
        match &state {
            TaskState::Completed { record_count, .. } => {
                info!(task = %task_id, records = record_count, "Task completed")
            }
            TaskState::Failed { error } => warn!(task = %task_id, error = %error, "Task failed"),
            TaskState::TimedOut => warn!(task = %task_id, "Task timed out"),
            _ => {}
        }
        task.state = state;
        task.updated_at = Utc::now();
        inner.persist()
    }

    pub fn task(&self, task_id: TaskId) -> Result<Option<TaskRecord>> {
        Ok(self
            .inner
            .read()?
            .manifest
            .tasks
            .iter()
            .find(|t| t.spec.task_id == task_id)
            .cloned())
    }

    pub fn tasks(&self) -> Result<Vec<TaskRecord>> {
        Ok(self.inner.read()?.manifest.tasks.clone())
    }

    /// Tasks not yet started
    pub fn pending_tasks(&self) -> Result<Vec<TaskSpec>> {
        Ok(self
            .inner
            .read()?
            .manifest
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Pending)
            .map(|t| t.spec.clone())
            .collect())
    }

    pub fn all_tasks_terminal(&self) -> Result<bool> {
        Ok(self.inner.read()?.pending_count() == 0)
    }

    /// Segments of completed tasks, in task order
    pub fn completed_segment_paths(&self) -> Result<Vec<PathBuf>> {
        let inner = self.inner.read()?;
        let mut completed: Vec<(TaskId, PathBuf)> = inner
            .manifest
            .tasks
            .iter()
            .filter_map(|t| match &t.state {
                TaskState::Completed { segment_path, .. } => {
                    Some((t.spec.task_id, segment_path.clone()))
                }
                _ => None,
            })
            .collect();
        completed.sort_by_key(|(id, _)| *id);
        Ok(completed.into_iter().map(|(_, path)| path).collect())
    }

    /// Failed and timed-out tasks
    pub fn failed_tasks(&self) -> Result<Vec<TaskRecord>> {
        Ok(self
            .inner
            .read()?
            .manifest
            .tasks
            .iter()
            .filter(|t| matches!(t.state, TaskState::Failed { .. } | TaskState::TimedOut))
            .cloned()
            .collect())
    }

    /// Poll until every task is terminal, or fail with `SessionIncomplete`
    pub async fn wait_until_terminal(&self, timeout: Duration, poll: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = self.inner.read()?.pending_count();
            if pending == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::SessionIncomplete { pending });
            }
            debug!(pending, "Waiting for tasks");
            tokio::time::sleep(poll.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }

    /// Close the session to new tasks once every task is terminal
    pub fn finalize(&self) -> Result<()> {
        let mut inner = self.inner.write()?;
        let pending = inner.pending_count();
        if pending > 0 {
            return Err(Error::SessionIncomplete { pending });
        }
        if inner.manifest.status == SessionStatus::Active {
            inner.manifest.status = SessionStatus::Completed;
            inner.persist()?;
            info!(session = %inner.manifest.session_id, "Session finalized");
        }
        Ok(())
    }

    /// Record that a merge consumed these segments. Files are kept.
    pub fn mark_merged(&self, paths: &[PathBuf]) -> Result<()> {
        let mut inner = self.inner.write()?;
        let mut changed = 0;
        for task in inner.manifest.tasks.iter_mut() {
            let consumed = match &task.state {
                TaskState::Completed { segment_path, .. } => paths.contains(segment_path),
                _ => false,
            };
            if consumed && task.segment == Some(SegmentLifecycle::Sealed) {
                task.segment = Some(SegmentLifecycle::Merged);
                task.updated_at = Utc::now();
                changed += 1;
            }
        }

        let all_merged = inner
            .manifest
            .tasks
            .iter()
            .filter(|t| matches!(t.state, TaskState::Completed { .. }))
            .all(|t| t.segment == Some(SegmentLifecycle::Merged));
        if all_merged && inner.manifest.status == SessionStatus::Completed {
            inner.manifest.status = SessionStatus::Merged;
        }
        if changed > 0 || inner.manifest.status == SessionStatus::Merged {
            inner.persist()?;
        }
        Ok(())
    }
}

fn read_manifest(dir: &Path) -> Result<SessionManifest> {
    let path = dir.join(MANIFEST_FILE);
    let raw = match std::fs::read(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound(format!("session manifest {}", path.display())))
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_slice(&raw)?)
}

/// Sessions under `sessions_root`, oldest first. Unreadable ones are skipped.
pub fn list_sessions<P: AsRef<Path>>(sessions_root: P) -> Result<Vec<SessionSummary>> {
    let root = sessions_root.as_ref();
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut sessions = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let dir = entry?.path();
        if !dir.is_dir() {
            continue;
        }
        match read_manifest(&dir) {
            Ok(manifest) => sessions.push(SessionSummary {
                session_id: manifest.session_id,
                dir,
                created_at: manifest.created_at,
                status: manifest.status,
                tasks: manifest.tasks.len(),
                completed: manifest
                    .tasks
                    .iter()
                    .filter(|t| matches!(t.state, TaskState::Completed { .. }))
                    .count(),
            }),
            Err(e) => warn!(dir = %dir.display(), error = %e, "Skipping unreadable session"),
        }
    }
    sessions.sort_by_key(|s| s.created_at);
    Ok(sessions)
}
