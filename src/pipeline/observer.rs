use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::stage::{Stage, StageSet};
use super::subset::{FilterSummary, SmokeSummary, SmokeTest};
use crate::adapters::SystemInfo;
use crate::model::Metadata;

/// Where a skipped stage's output came from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecoverySource {
    Checkpoint,
    ResultStore,
    AdapterIndex,
    NotNeeded,
    Missing,
}

impl RecoverySource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Checkpoint => "checkpoint",
            Self::ResultStore => "result_store",
            Self::AdapterIndex => "adapter_index",
            Self::NotNeeded => "not_needed",
            Self::Missing => "missing",
        }
    }
}

#[derive(Debug)]
pub enum PipelineEvent<'a> {
    RunStarted {
        dataset_name: &'a str,
        system: &'a SystemInfo,
        requested: &'a StageSet,
        smoke_test: Option<SmokeTest>,
    },
    SmokeTestApplied(&'a SmokeSummary),
    CategoriesFiltered(&'a FilterSummary),
    CheckpointLoaded {
        run_name: &'a str,
        completed: &'a StageSet,
    },
    DatasetChanged {
        run_name: &'a str,
    },
    StageStarted(Stage),
    StageCompleted {
        stage: Stage,
        items: usize,
        elapsed: Duration,
    },
    StageReloaded {
        stage: Stage,
        source: RecoverySource,
    },
    PrerequisiteLoaded {
        stage: Stage,
        source: RecoverySource,
    },
    StageNotRequested(Stage),
    /// Add's index was reopened or rebuilt because a running stage searches it.
    IndexRecovered {
        location: Option<&'a Path>,
        metadata: &'a Metadata,
    },
    WaitStarted {
        seconds: u64,
    },
    WaitProgress {
        elapsed_seconds: u64,
        total_seconds: u64,
    },
    WaitCompleted,
    ReportWritten {
        path: &'a Path,
        report: &'a str,
    },
}

/// Receives progress from the orchestrator; the orchestrator holds no global logger.
pub trait PipelineObserver {
    fn on_event(&self, event: &PipelineEvent<'_>);
}

/// Writes pipeline progress through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn on_event(&self, event: &PipelineEvent<'_>) {
        match event {
            PipelineEvent::RunStarted {
                dataset_name,
                system,
                requested,
                smoke_test,
            } => {
                let stages = requested
                    .iter()
                    .map(|stage| stage.as_str())
                    .collect::<Vec<_>>()
                    .join(",");
                info!(
                    dataset = %dataset_name,
                    system = %system.name,
                    system_version = %system.version,
                    system_details = %serde_json::Value::Object(system.details.clone()),
                    stages = %stages,
                    "starting evaluation pipeline"
                );
                if let Some(smoke) = smoke_test {
                    info!(
                        messages = smoke.message_count,
                        questions = smoke.question_count,
                        "smoke test mode enabled"
                    );
                }
            }
            PipelineEvent::SmokeTestApplied(summary) => info!(
                conversation = %summary.conversation_id,
                messages = summary.messages_kept,
                messages_total = summary.messages_total,
                questions = summary.questions_kept,
                questions_total = summary.questions_total,
                "smoke test applied"
            ),
            PipelineEvent::CategoriesFiltered(summary) => info!(
                removed = summary.removed,
                remaining = summary.remaining,
                categories = %summary.categories.join(", "),
                "filtered question categories"
            ),
            PipelineEvent::CheckpointLoaded {
                run_name,
                completed,
            } => info!(
                run_name = %run_name,
                completed = completed.len(),
                "resuming from checkpoint"
            ),
            PipelineEvent::DatasetChanged { run_name } => warn!(
                run_name = %run_name,
                "dataset differs from the one recorded in the checkpoint; completed stages are still skipped"
            ),
            PipelineEvent::StageStarted(stage) => info!(stage = %stage, "stage started"),
            PipelineEvent::StageCompleted {
                stage,
                items,
                elapsed,
            } => info!(
                stage = %stage,
                items = items,
                elapsed_ms = elapsed.as_millis() as u64,
                "stage completed"
            ),
            PipelineEvent::StageReloaded { stage, source } => {
                if *source == RecoverySource::Missing {
                    warn!(stage = %stage, "stage completed earlier but its output is gone");
                } else {
                    info!(stage = %stage, source = source.as_str(), "skipped completed stage");
                }
            }
            PipelineEvent::PrerequisiteLoaded { stage, source } => info!(
                stage = %stage,
                source = source.as_str(),
                "loaded output of skipped stage"
            ),
            PipelineEvent::StageNotRequested(stage) => {
                debug!(stage = %stage, "stage not requested")
            }
            PipelineEvent::IndexRecovered { location, metadata } => info!(
                location = %location.map(|path| path.display().to_string()).unwrap_or_default(),
                index = %serde_json::Value::Object((*metadata).clone()),
                "recovered memory index"
            ),
            PipelineEvent::WaitStarted { seconds } => info!(
                seconds = seconds,
                "waiting for backend indexing to settle"
            ),
            PipelineEvent::WaitProgress {
                elapsed_seconds,
                total_seconds,
            } => debug!(
                elapsed = elapsed_seconds,
                total = total_seconds,
                "indexing wait progress"
            ),
            PipelineEvent::WaitCompleted => info!("post-add wait completed"),
            PipelineEvent::ReportWritten { path, report } => {
                for line in report.lines().filter(|line| !line.trim().is_empty()) {
                    info!("{line}");
                }
                info!(path = %path.display(), "wrote report");
            }
        }
    }
}

/// Shared flag that aborts a run at the next check.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
