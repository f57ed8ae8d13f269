//! Choosing which segments of a session a merge may read

use crate::config::MergeConfig;
use crate::error::Result;
use crate::index::tags::TagIndex;
use crate::merge::engine::{self, ExcludedSegment, MergeStream};
use crate::merge::filter::MergeFilter;
use crate::session::registry::{SessionRegistry, TaskState};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Segments to merge plus those left out by the registry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePlan {
    pub segments: Vec<PathBuf>,
    pub excluded: Vec<ExcludedSegment>,
}

impl MergePlan {
    pub fn from_paths(segments: Vec<PathBuf>) -> Self {
        Self {
            segments,
            excluded: Vec::new(),
        }
    }

    /// Plan a merge of one session.
    ///
    /// Waits up to `wait` for running or pending tasks, then fails with
    /// `SessionIncomplete` if any remain. Segments of failed or timed-out
    /// tasks are never read; each one left on disk is reported as excluded.
    pub async fn from_registry(
        registry: &SessionRegistry,
        wait: Duration,
        poll: Duration,
    ) -> Result<Self> {
        if !registry.all_tasks_terminal()? {
            info!(wait_ms = wait.as_millis() as u64, "Waiting for running tasks before merge");
            registry.wait_until_terminal(wait, poll).await?;
        }

        let mut excluded = Vec::new();
        for task in registry.failed_tasks()? {
            let path = &task.spec.segment_path;
            if !path.exists() {
                continue;
            }
            let reason = match &task.state {
                TaskState::Failed { error } => format!("task {} failed: {}", task.spec.task_id, error),
                _ => format!("task {} timed out", task.spec.task_id),
            };
            warn!(segment = %path.display(), reason = %reason, "Excluding segment of unsuccessful task");
            excluded.push(ExcludedSegment {
                segment: path.display().to_string(),
                reason,
            });
        }

        Ok(Self {
            segments: registry.completed_segment_paths()?,
            excluded,
        })
    }

    /// Merge the planned segments; planned exclusions show up in the report.
    pub fn execute<'t>(
        &self,
        tags: Option<&'t TagIndex>,
        filter: MergeFilter,
        config: &MergeConfig,
    ) -> Result<MergeStream<'t>> {
        engine::merge_paths(&self.segments, tags, filter, config, self.excluded.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentConfig;
    use crate::core::event::{Event, EventData};
    use crate::core::temporal::Timestamp;
    use crate::error::Error;
    use crate::session::registry::{TaskOutcome, TaskSpec};
    use crate::storage::SegmentWriter;
    use tempfile::TempDir;

    fn write_segment(spec: &TaskSpec, seal: bool) -> u64 {
        let config = SegmentConfig {
            flush_records: 1,
            sync_on_flush: false,
            ..Default::default()
        };
        let mut writer = SegmentWriter::open_writable(&spec.segment_path, &config).unwrap();
        let data = writer
            .append_event_data(EventData::new("t").with_attribute("task", spec.task_id.0 as i64))
            .unwrap();
        writer
            .append_event(Event::new(Timestamp::from_secs(spec.task_id.0 as i64), "t", data))
            .unwrap();
        if seal {
            writer.seal().unwrap().record_count
        } else {
            writer.abandon();
            0
        }
    }

    #[tokio::test]
    async fn test_failed_task_segment_excluded() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::create(dir.path()).unwrap();
        let ok = registry.register_task("ok").unwrap();
        let bad = registry.register_task("bad").unwrap();

        registry.mark_running(ok.task_id).unwrap();
        registry.mark_running(bad.task_id).unwrap();
        let records = write_segment(&ok, true);
        write_segment(&bad, false);
        registry
            .report_task_result(ok.task_id, TaskOutcome::Completed {
                segment_path: ok.segment_path.clone(),
                record_count: records,
            })
            .unwrap();
        registry.report_task_result(bad.task_id, TaskOutcome::TimedOut).unwrap();

        let plan = MergePlan::from_registry(&registry, Duration::from_millis(10), Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(plan.segments, vec![ok.segment_path.clone()]);
        assert_eq!(plan.excluded.len(), 1);
        assert!(plan.excluded[0].reason.contains("timed out"));

        let mut stream = plan.execute(None, MergeFilter::new(), &MergeConfig::default()).unwrap();
        assert_eq!(stream.by_ref().count(), 1);
        assert_eq!(stream.report().excluded.len(), 1);
    }

    #[tokio::test]
    async fn test_running_task_blocks_merge() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::create(dir.path()).unwrap();
        let spec = registry.register_task("still going").unwrap();
        registry.mark_running(spec.task_id).unwrap();

        let err = MergePlan::from_registry(&registry, Duration::from_millis(20), Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionIncomplete { pending: 1 }));
    }

    #[tokio::test]
    async fn test_nothing_usable_is_fatal() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::create(dir.path()).unwrap();
        let spec = registry.register_task("x").unwrap();
        registry
            .report_task_result(spec.task_id, TaskOutcome::Failed { error: "crash".into() })
            .unwrap();

        let plan = MergePlan::from_registry(&registry, Duration::ZERO, Duration::from_millis(1))
            .await
            .unwrap();
        assert!(plan.segments.is_empty());
        assert!(matches!(
            plan.execute(None, MergeFilter::new(), &MergeConfig::default()),
            Err(Error::NoValidSegments { .. })
        ));
    }
}
