//! Processing sessions: the task registry and the coordinator driving it

pub mod coordinator;
pub mod registry;

pub use coordinator::{
    CompletionReport, Coordinator, InProcessExecutor, ProcessExecutor, ReportStatus, RunSummary,
    TaskExecutor,
};
pub use registry::{
    list_sessions, SegmentLifecycle, SessionManifest, SessionRegistry, SessionStatus,
    SessionSummary, TaskId, TaskOutcome, TaskRecord, TaskSpec, TaskState,
};
