//! Command-line front end

pub mod commands;

pub use commands::{Cli, Commands};

use crate::config::StoreConfig;
use crate::core::temporal::TimeRange;
use crate::ingest::run_ingest_task;
use crate::merge::MergeFilter;
use crate::output::{render_all, JsonLinesRenderer};
use crate::session::{InProcessExecutor, ProcessExecutor, TaskExecutor, TaskId, TaskSpec};
use crate::storage::{read_header, segment_state, SegmentReader, SegmentState};
use crate::store::TimelineStore;
use anyhow::{bail, Context};
use serde_json::json;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Run a parsed command line
pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => StoreConfig::default(),
    };

    match cli.command {
        Commands::Worker {
            task_id,
            input,
            segment,
        } => {
            let task = TaskSpec {
                task_id: TaskId(task_id),
                input,
                segment_path: segment,
            };
            let report = run_ingest_task(&task, &config.segment)
                .with_context(|| format!("task {} failed", task_id))?;
            println!("{}", serde_json::to_string(&report)?);
            Ok(())
        }

        Commands::Run {
            inputs,
            workers,
            timeout_secs,
            in_process,
        } => {
            if let Some(workers) = workers {
                config.coordinator.max_workers = workers;
            }
            if let Some(secs) = timeout_secs {
                config.coordinator.task_timeout_secs = secs;
            }
            let segment_config = config.segment.clone();
            let store = TimelineStore::open(&cli.store, config)?;

            let registry = store.create_session()?;
            for input in &inputs {
                let input = std::fs::canonicalize(input)
                    .with_context(|| format!("input {}", input))?;
                registry.register_task(input.display().to_string())?;
            }

            let executor: Arc<dyn TaskExecutor> = if in_process {
                Arc::new(InProcessExecutor::new(move |task: &TaskSpec| {
                    run_ingest_task(task, &segment_config)
                }))
            } else {
                let mut executor = ProcessExecutor::current_exe()?;
                if let Some(path) = &cli.config {
                    executor = executor.with_config(std::fs::canonicalize(path)?);
                }
                Arc::new(executor)
            };

            let summary = store.run_session(&registry, executor).await?;
            if summary.failed + summary.timed_out > 0 {
                warn!(
                    failed = summary.failed,
                    timed_out = summary.timed_out,
                    "Some tasks did not complete"
                );
            }
            println!(
                "{}",
                json!({ "session": registry.session_id()?, "summary": summary })
            );
            Ok(())
        }

        Commands::Merge {
            session,
            all,
            output,
            start,
            end,
            data_types,
            attribute,
            contains,
            no_dedup,
        } => {
            config.merge.deduplicate = !no_dedup;
            let store = TimelineStore::open(&cli.store, config)?;

            let session_ids = if all {
                store.sessions()?.into_iter().map(|s| s.session_id).collect()
            } else if session.is_empty() {
                match store.sessions()?.last() {
                    Some(latest) => vec![latest.session_id],
                    None => bail!("no sessions in {}", cli.store.display()),
                }
            } else {
                session
            };
            let registries = session_ids
                .iter()
                .map(|id| store.open_session(*id))
                .collect::<crate::error::Result<Vec<_>>>()?;

            let mut filter = MergeFilter::new().with_time_range(TimeRange::new(
                start.unwrap_or(TimeRange::all().start),
                end.unwrap_or(TimeRange::all().end),
            ));
            if !data_types.is_empty() {
                filter = filter.with_data_types(data_types);
            }
            if let (Some(attribute), Some(needle)) = (attribute, contains) {
                filter = filter.with_text(attribute, needle);
            }

            let mut stream = store.merge_sessions(&registries, filter).await?;
            let out: Box<dyn Write> = match &output {
                Some(path) => Box::new(BufWriter::new(
                    File::create(path).with_context(|| format!("creating {}", path.display()))?,
                )),
                None => Box::new(BufWriter::new(std::io::stdout().lock())),
            };
            let mut renderer = JsonLinesRenderer::new(out);
            render_all(&mut renderer, stream.by_ref())?;

            for registry in &registries {
                store.mark_merged(registry, &stream)?;
            }
            let report = stream.report();
            for excluded in &report.excluded {
                warn!(segment = %excluded.segment, reason = %excluded.reason, "Segment excluded");
            }
            info!(
                events = report.events_emitted,
                duplicates = report.duplicates_dropped,
                skipped = report.records_skipped,
                filtered = report.filtered,
                excluded = report.excluded.len(),
                "Merge finished"
            );
            Ok(())
        }

        Commands::Tag {
            event,
            labels,
            comment,
        } => {
            let mut store = TimelineStore::open(&cli.store, config)?;
            let tag = store.tag_index_mut().add_tag(event, labels, comment)?;
            println!("{}", serde_json::to_string(&tag)?);
            Ok(())
        }

        Commands::Inspect { segment: Some(path) } => {
            println!("{}", serde_json::to_string_pretty(&describe_segment(&path)?)?);
            Ok(())
        }

        Commands::Inspect { segment: None } => {
            let store = TimelineStore::open(&cli.store, config)?;
            for session in store.sessions()? {
                println!("{}", serde_json::to_string(&session)?);
            }
            Ok(())
        }
    }
}

fn describe_segment(path: &Path) -> anyhow::Result<serde_json::Value> {
    let header = read_header(path)?;
    let base = json!({
        "path": PathBuf::from(path),
        "segment_id": header.segment_id,
        "codec_version": header.codec_version,
        "created_at": header.created_at.to_string(),
    });

    let detail = match segment_state(path)? {
        SegmentState::Open => json!({ "state": SegmentState::Open }),
        SegmentState::Sealed => {
            let reader = SegmentReader::open_readonly(path)?;
            json!({
                "state": SegmentState::Sealed,
                "records": reader.record_count(),
                "events": reader.event_count(),
                "time_bounds": reader.time_bounds().map(|r| [r.start.to_string(), r.end.to_string()]),
            })
        }
    };

    let mut merged = base;
    if let (Some(target), Some(extra)) = (merged.as_object_mut(), detail.as_object()) {
        target.extend(extra.clone());
    }
    Ok(merged)
}
