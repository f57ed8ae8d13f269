//! Store directory facade
//!
//! ```text
//! <root>/
//!   tags.idx                  tag index shared by every session
//!   sessions/<uuid>/
//!     session.json            manifest
//!     segments/task-<n>.seg   one segment per task
//! ```

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::index::tags::TagIndex;
use crate::merge::{MergeFilter, MergePlan, MergeStream};
use crate::session::{
    list_sessions, Coordinator, RunSummary, SessionRegistry, SessionSummary, TaskExecutor,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

pub const SESSIONS_DIR: &str = "sessions";
pub const TAG_INDEX_FILE: &str = "tags.idx";

/// A store directory holding sessions, their segments, and the tag index
pub struct TimelineStore {
    root: PathBuf,
    config: StoreConfig,
    tags: TagIndex,
}

impl TimelineStore {
    /// Open (or initialise) the store at `root`
    pub fn open<P: AsRef<Path>>(root: P, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join(SESSIONS_DIR))?;
        let tags = TagIndex::open(root.join(TAG_INDEX_FILE))?;
        info!(root = %root.display(), tagged_events = tags.len(), "Opened store");
        Ok(Self { root, config, tags })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn session_dir(&self, session_id: Uuid) -> PathBuf {
        self.root.join(SESSIONS_DIR).join(session_id.to_string())
    }

    pub fn create_session(&self) -> Result<SessionRegistry> {
        let session_id = Uuid::new_v4();
        SessionRegistry::create_with_id(self.session_dir(session_id), session_id)
    }

    pub fn open_session(&self, session_id: Uuid) -> Result<SessionRegistry> {
        SessionRegistry::open(self.session_dir(session_id))
    }

    /// Every session in the store, oldest first
    pub fn sessions(&self) -> Result<Vec<SessionSummary>> {
        list_sessions(self.root.join(SESSIONS_DIR))
    }

    /// Run a session's pending tasks and close it to new ones
    pub async fn run_session(
        &self,
        registry: &SessionRegistry,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<RunSummary> {
        let summary = Coordinator::new(&self.config.coordinator)
            .run(registry, executor)
            .await?;
        registry.finalize()?;
        Ok(summary)
    }

    /// Plan a session merge with the configured wait policy
    pub async fn plan_session(&self, registry: &SessionRegistry) -> Result<MergePlan> {
        MergePlan::from_registry(
            registry,
            self.config.coordinator.task_timeout(),
            self.config.coordinator.poll_interval(),
        )
        .await
    }

    /// Merged timeline of one session, with tags attached
    pub async fn merge_session(
        &self,
        registry: &SessionRegistry,
        filter: MergeFilter,
    ) -> Result<MergeStream<'_>> {
        let plan = self.plan_session(registry).await?;
        plan.execute(Some(&self.tags), filter, &self.config.merge)
    }

    /// Merged timeline across several sessions (e.g. a resumed run)
    #[instrument(skip_all, fields(sessions = registries.len()))]
    pub async fn merge_sessions(
        &self,
        registries: &[SessionRegistry],
        filter: MergeFilter,
    ) -> Result<MergeStream<'_>> {
        if registries.is_empty() {
            return Err(Error::NoValidSegments { excluded: 0 });
        }
        let mut combined = MergePlan::default();
        for registry in registries {
            let plan = self.plan_session(registry).await?;
            combined.segments.extend(plan.segments);
            combined.excluded.extend(plan.excluded);
        }
        combined.execute(Some(&self.tags), filter, &self.config.merge)
    }

    /// Record that a finished merge pass consumed its segments.
    ///
    /// Fails while the stream still has events left.
    pub fn mark_merged(&self, registry: &SessionRegistry, stream: &MergeStream<'_>) -> Result<()> {
        if !stream.is_finished() {
            return Err(Error::Registry(
                "merge pass has not been read to the end".into(),
            ));
        }
        registry.mark_merged(&stream.segment_paths())
    }

    pub fn tag_index(&self) -> &TagIndex {
        &self.tags
    }

    pub fn tag_index_mut(&mut self) -> &mut TagIndex {
        &mut self.tags
    }

    /// Pick up tags written by other processes
    pub fn refresh_tags(&mut self) -> Result<usize> {
        self.tags.refresh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::EventIdentifier;
    use crate::ingest::run_ingest_task;
    use crate::session::{InProcessExecutor, SessionStatus, TaskSpec};
    use tempfile::TempDir;

    fn write_input(dir: &Path, name: &str, secs: &[i64]) -> String {
        let lines: Vec<String> = secs
            .iter()
            .map(|s| {
                format!(
                    r#"{{"timestamp": {}, "data_type": "test:{}", "attributes": {{"n": {}}}}}"#,
                    s * 1_000_000,
                    name,
                    s
                )
            })
            .collect();
        let path = dir.join(format!("{}.jsonl", name));
        std::fs::write(&path, lines.join("\n")).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn test_session_run_merge_and_tag() {
        let inputs = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let mut store = TimelineStore::open(root.path(), StoreConfig::default()).unwrap();

        let registry = store.create_session().unwrap();
        registry.register_task(write_input(inputs.path(), "a", &[5, 1, 3])).unwrap();
        registry.register_task(write_input(inputs.path(), "b", &[2, 4])).unwrap();

        let executor = InProcessExecutor::new(|task: &TaskSpec| {
            run_ingest_task(task, &crate::config::SegmentConfig::default())
        });
        let summary = store.run_session(&registry, Arc::new(executor)).await.unwrap();
        assert_eq!(summary.completed, 2);
        assert_eq!(registry.status().unwrap(), SessionStatus::Completed);

        let third: EventIdentifier = {
            let stream = store.merge_session(&registry, MergeFilter::new()).await.unwrap();
            let events: Vec<_> = stream.collect();
            let secs: Vec<i64> = events.iter().map(|e| e.event.timestamp.as_secs()).collect();
            assert_eq!(secs, vec![1, 2, 3, 4, 5]);
            events[2].identifier
        };

        store.tag_index_mut().add_tag(third, ["suspicious"], None).unwrap();
        let mut stream = store.merge_session(&registry, MergeFilter::new()).await.unwrap();
        assert!(matches!(
            store.mark_merged(&registry, &stream),
            Err(Error::Registry(_))
        ));
        assert_eq!(registry.status().unwrap(), SessionStatus::Completed);

        let tagged: Vec<_> = stream.by_ref().filter(|e| e.tag.is_some()).collect();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].identifier, third);
        store.mark_merged(&registry, &stream).unwrap();

        let reopened = store.open_session(registry.session_id().unwrap()).unwrap();
        assert_eq!(reopened.status().unwrap(), SessionStatus::Merged);
        assert_eq!(store.sessions().unwrap().len(), 1);
    }
}
