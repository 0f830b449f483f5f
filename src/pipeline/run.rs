use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use super::checkpoint::{CheckpointManager, CheckpointSnapshot};
use super::error::PipelineError;
use super::observer::{CancellationToken, PipelineEvent, PipelineObserver, RecoverySource};
use super::report::render_report;
use super::stage::{Stage, StageAction, StageSet, all_stages, plan_stages};
use super::stages::{run_add_stage, run_answer_stage, run_evaluate_stage, run_search_stage};
use super::store::ResultStore;
use super::subset::{SmokeTest, apply_smoke_test, dataset_fingerprint, filter_categories};
use crate::adapters::{IndexHandle, MemoryAdapter, SearchOptions};
use crate::answer::AnswerProvider;
use crate::evaluate::Evaluator;
use crate::model::{AnswerResult, Dataset, EvaluationResult, Metadata, SearchResult};

pub const REPORT_FILE_NAME: &str = "report.txt";

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub output_dir: PathBuf,
    pub run_name: String,
    pub use_checkpoint: bool,
    /// Length of one second of the post-add wait; shortened in tests.
    pub wait_tick: Duration,
}

impl PipelineOptions {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            run_name: "default".to_string(),
            use_checkpoint: true,
            wait_tick: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub stages: StageSet,
    pub smoke_test: Option<SmokeTest>,
    /// Categories whose questions are dropped before any stage runs.
    pub excluded_categories: BTreeSet<String>,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            stages: all_stages(),
            smoke_test: None,
            excluded_categories: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PipelineOutcome {
    pub dataset_name: String,
    pub executed: Vec<Stage>,
    pub completed_stages: StageSet,
    pub ingestion: Option<Metadata>,
    pub index: Option<IndexHandle>,
    pub search_results: Option<Vec<SearchResult>>,
    pub answer_results: Option<Vec<AnswerResult>>,
    pub eval_result: Option<EvaluationResult>,
    pub report: String,
    pub elapsed: Duration,
}

/// Sequences Add, Search, Answer and Evaluate with checkpointed resumption.
///
/// One run owns its output directory and checkpoint while it executes. Running two
/// pipelines against the same output directory and run name at once is unsupported and
/// is not detected.
pub struct Pipeline<'a> {
    adapter: &'a dyn MemoryAdapter,
    answerer: &'a dyn AnswerProvider,
    evaluator: &'a dyn Evaluator,
    observer: &'a dyn PipelineObserver,
    options: PipelineOptions,
    cancellation: CancellationToken,
}

struct RunContext<'d> {
    dataset: &'d Dataset,
    store: ResultStore,
    checkpoint: Option<CheckpointManager>,
    fingerprint: String,
    completed: StageSet,
    outcome: PipelineOutcome,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        adapter: &'a dyn MemoryAdapter,
        answerer: &'a dyn AnswerProvider,
        evaluator: &'a dyn Evaluator,
        observer: &'a dyn PipelineObserver,
        options: PipelineOptions,
    ) -> Self {
        Self {
            adapter,
            answerer,
            evaluator,
            observer,
            options,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn run(&self, dataset: &Dataset, request: &RunRequest) -> Result<PipelineOutcome> {
        let started = Instant::now();
        let system = self.adapter.system_info();

        self.observer.on_event(&PipelineEvent::RunStarted {
            dataset_name: &dataset.dataset_name,
            system: &system,
            requested: &request.stages,
            smoke_test: request.smoke_test,
        });

        let dataset = self.prepare_dataset(dataset, request);
        let mut ctx = self.open_run(&dataset)?;

        for plan in plan_stages(&request.stages, &ctx.completed) {
            match plan.action {
                StageAction::Run => {
                    self.ensure_not_cancelled(plan.stage)?;
                    self.execute_stage(plan.stage, &mut ctx)?;
                    if plan.stage == Stage::Add && request.stages.contains(&Stage::Search) {
                        self.wait_for_indexing()?;
                    }
                }
                StageAction::Reload => {
                    let source = self.recover_stage(plan.stage, plan.needed_downstream, &mut ctx)?;
                    self.observer.on_event(&PipelineEvent::StageReloaded {
                        stage: plan.stage,
                        source,
                    });
                }
                StageAction::LoadPrerequisite => {
                    let source = self.recover_stage(plan.stage, true, &mut ctx)?;
                    self.observer.on_event(&PipelineEvent::PrerequisiteLoaded {
                        stage: plan.stage,
                        source,
                    });
                }
                StageAction::Skip => {
                    self.observer
                        .on_event(&PipelineEvent::StageNotRequested(plan.stage));
                }
            }
        }

        let elapsed = started.elapsed();
        let report = render_report(&system.name, elapsed, ctx.outcome.eval_result.as_ref());
        ctx.store.save_text(REPORT_FILE_NAME, &report)?;
        self.observer.on_event(&PipelineEvent::ReportWritten {
            path: &ctx.store.path(REPORT_FILE_NAME),
            report: &report,
        });

        let mut outcome = ctx.outcome;
        outcome.dataset_name = dataset.dataset_name.clone();
        outcome.completed_stages = ctx.completed;
        outcome.report = report;
        outcome.elapsed = elapsed;
        Ok(outcome)
    }

    /// Smoke truncation then category filtering; the caller's dataset is never modified.
    fn prepare_dataset(&self, dataset: &Dataset, request: &RunRequest) -> Dataset {
        let mut prepared = match request
            .smoke_test
            .and_then(|smoke| apply_smoke_test(dataset, smoke))
        {
            Some((truncated, summary)) => {
                self.observer
                    .on_event(&PipelineEvent::SmokeTestApplied(&summary));
                truncated
            }
            None => dataset.clone(),
        };

        if !request.excluded_categories.is_empty() {
            let (filtered, summary) = filter_categories(&prepared, &request.excluded_categories);
            if summary.removed > 0 {
                self.observer
                    .on_event(&PipelineEvent::CategoriesFiltered(&summary));
            }
            prepared = filtered;
        }

        prepared
    }

    fn open_run<'d>(&self, dataset: &'d Dataset) -> Result<RunContext<'d>> {
        let store = ResultStore::new(&self.options.output_dir)?;
        let checkpoint = self
            .options
            .use_checkpoint
            .then(|| CheckpointManager::new(&self.options.output_dir, &self.options.run_name));
        let fingerprint = dataset_fingerprint(dataset)?;

        let mut ctx = RunContext {
            dataset,
            store,
            checkpoint,
            fingerprint,
            completed: StageSet::new(),
            outcome: PipelineOutcome::default(),
        };

        let Some(manager) = ctx.checkpoint.as_ref() else {
            return Ok(ctx);
        };
        let Some(record) = manager.load()? else {
            return Ok(ctx);
        };

        self.observer.on_event(&PipelineEvent::CheckpointLoaded {
            run_name: manager.run_name(),
            completed: &record.completed_stages,
        });
        if record
            .dataset_fingerprint
            .as_deref()
            .is_some_and(|recorded| recorded != ctx.fingerprint)
        {
            self.observer.on_event(&PipelineEvent::DatasetChanged {
                run_name: manager.run_name(),
            });
        }

        let completed = record.completed_stages;
        if completed.contains(&Stage::Search) {
            ctx.outcome.search_results = record.search_results;
        }
        if completed.contains(&Stage::Answer) {
            ctx.outcome.answer_results = record.answer_results;
        }
        if completed.contains(&Stage::Evaluate) {
            ctx.outcome.eval_result = record.eval_results;
        }
        ctx.completed = completed;

        Ok(ctx)
    }

    fn execute_stage(&self, stage: Stage, ctx: &mut RunContext<'_>) -> Result<()> {
        self.observer.on_event(&PipelineEvent::StageStarted(stage));
        let started = Instant::now();

        let items = match stage {
            Stage::Add => {
                let added = run_add_stage(self.adapter, ctx.dataset, &self.options.output_dir)?;
                ctx.store.save(stage.artifact_name(), &added.ingestion)?;
                ctx.outcome.ingestion = Some(added.ingestion);
                ctx.outcome.index = added.index;
                ctx.dataset.conversations.len()
            }
            Stage::Search => {
                let options = SearchOptions {
                    top_k: self.adapter.config().top_k,
                };
                let results = run_search_stage(
                    self.adapter,
                    &ctx.dataset.qa_pairs,
                    ctx.outcome.index.as_ref(),
                    &options,
                )?;
                ctx.store.save(stage.artifact_name(), &results)?;
                let count = results.len();
                ctx.outcome.search_results = Some(results);
                count
            }
            Stage::Answer => {
                let search_results = required_output(&ctx.outcome.search_results, Stage::Search)?;
                let answers =
                    run_answer_stage(self.answerer, &ctx.dataset.qa_pairs, search_results)?;
                ctx.store.save(stage.artifact_name(), &answers)?;
                let count = answers.len();
                ctx.outcome.answer_results = Some(answers);
                count
            }
            Stage::Evaluate => {
                let answers = required_output(&ctx.outcome.answer_results, Stage::Answer)?;
                let result = run_evaluate_stage(self.evaluator, answers)?;
                ctx.store.save(stage.artifact_name(), &result)?;
                let count = result.total_questions;
                ctx.outcome.eval_result = Some(result);
                count
            }
        };

        ctx.completed.insert(stage);
        ctx.outcome.executed.push(stage);
        self.save_checkpoint(ctx)?;

        self.observer.on_event(&PipelineEvent::StageCompleted {
            stage,
            items,
            elapsed: started.elapsed(),
        });
        Ok(())
    }

    /// Recovers a skipped stage's output: checkpoint payload first, then the result store.
    /// A missing output is fatal only when `needed` is set.
    fn recover_stage(
        &self,
        stage: Stage,
        needed: bool,
        ctx: &mut RunContext<'_>,
    ) -> Result<RecoverySource> {
        let store = &ctx.store;
        let outcome = &mut ctx.outcome;

        let source = match stage {
            Stage::Add => {
                if !needed {
                    return Ok(RecoverySource::NotNeeded);
                }
                outcome.index = self
                    .adapter
                    .build_or_recover_index(&ctx.dataset.conversations, &self.options.output_dir)?;
                if let Some(index) = &outcome.index {
                    self.observer.on_event(&PipelineEvent::IndexRecovered {
                        location: index.location.as_deref(),
                        metadata: &index.metadata,
                    });
                }
                return Ok(RecoverySource::AdapterIndex);
            }
            Stage::Search => recover_output(&mut outcome.search_results, store, stage)?,
            Stage::Answer => recover_output(&mut outcome.answer_results, store, stage)?,
            Stage::Evaluate => recover_output(&mut outcome.eval_result, store, stage)?,
        };

        if source == RecoverySource::Missing && needed {
            return Err(PipelineError::MissingPrerequisite {
                stage,
                artifact: stage.artifact_name().to_string(),
            }
            .into());
        }
        Ok(source)
    }

    fn save_checkpoint(&self, ctx: &RunContext<'_>) -> Result<()> {
        let Some(manager) = ctx.checkpoint.as_ref() else {
            return Ok(());
        };

        manager.save(
            &ctx.completed,
            CheckpointSnapshot {
                dataset_fingerprint: Some(&ctx.fingerprint),
                search_results: ctx.outcome.search_results.as_deref(),
                answer_results: ctx.outcome.answer_results.as_deref(),
                eval_results: ctx.outcome.eval_result.as_ref(),
            },
        )
    }

    fn wait_for_indexing(&self) -> Result<()> {
        let seconds = self.adapter.config().post_add_wait_seconds;
        if seconds == 0 {
            return Ok(());
        }

        self.observer
            .on_event(&PipelineEvent::WaitStarted { seconds });
        for elapsed in 1..=seconds {
            self.ensure_not_cancelled(Stage::Search)?;
            thread::sleep(self.options.wait_tick);
            self.observer.on_event(&PipelineEvent::WaitProgress {
                elapsed_seconds: elapsed,
                total_seconds: seconds,
            });
        }
        self.ensure_not_cancelled(Stage::Search)?;
        self.observer.on_event(&PipelineEvent::WaitCompleted);
        Ok(())
    }

    fn ensure_not_cancelled(&self, stage: Stage) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(PipelineError::Cancelled { stage }.into());
        }
        Ok(())
    }
}

fn required_output<T>(slot: &Option<T>, stage: Stage) -> Result<&T> {
    slot.as_ref().ok_or_else(|| {
        PipelineError::MissingPrerequisite {
            stage,
            artifact: stage.artifact_name().to_string(),
        }
        .into()
    })
}

fn recover_output<T: serde::de::DeserializeOwned>(
    slot: &mut Option<T>,
    store: &ResultStore,
    stage: Stage,
) -> Result<RecoverySource> {
    if slot.is_some() {
        return Ok(RecoverySource::Checkpoint);
    }

    match store.load_optional(stage.artifact_name())? {
        Some(value) => {
            *slot = Some(value);
            Ok(RecoverySource::ResultStore)
        }
        None => Ok(RecoverySource::Missing),
    }
}
