use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::adapters::{AdapterConfig, build_adapter};
use crate::answer::ExtractiveAnswerer;
use crate::cli::RunArgs;
use crate::evaluate::LexicalMatchEvaluator;
use crate::model::Dataset;
use crate::pipeline::{
    Pipeline, PipelineOptions, RunRequest, SmokeTest, TracingObserver, all_stages,
    declared_filter_categories,
};

pub fn run(args: RunArgs) -> Result<()> {
    let output_dir = args.output_dir();
    let dataset = load_dataset(&args.dataset)?;
    let config = adapter_config(&args)?;
    let adapter = build_adapter(&args.system, config, &output_dir)?;
    let evaluator = LexicalMatchEvaluator::new()?;

    let request = run_request(&args, &dataset);
    let options = PipelineOptions {
        run_name: args.run_name.clone(),
        use_checkpoint: !args.no_checkpoint,
        ..PipelineOptions::new(&output_dir)
    };

    let pipeline = Pipeline::new(
        adapter.as_ref(),
        &ExtractiveAnswerer,
        &evaluator,
        &TracingObserver,
        options,
    );
    let outcome = pipeline.run(&dataset, &request)?;

    info!(
        dataset = %outcome.dataset_name,
        executed = outcome.executed.len(),
        completed = outcome.completed_stages.len(),
        ingested = outcome.ingestion.is_some(),
        elapsed_ms = outcome.elapsed.as_millis() as u64,
        output_dir = %output_dir.display(),
        "pipeline finished"
    );
    print!("{}", outcome.report);
    Ok(())
}

fn load_dataset(path: &Path) -> Result<Dataset> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let dataset: Dataset = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse dataset {}", path.display()))?;

    info!(
        path = %path.display(),
        dataset = %dataset.dataset_name,
        conversations = dataset.conversations.len(),
        questions = dataset.qa_pairs.len(),
        "loaded dataset"
    );
    Ok(dataset)
}

/// Config file first, then command-line overrides.
fn adapter_config(args: &RunArgs) -> Result<AdapterConfig> {
    let mut config = match &args.adapter_config {
        Some(path) => AdapterConfig::load(path)?,
        None => AdapterConfig::default(),
    };
    if let Some(seconds) = args.post_add_wait_seconds {
        config.post_add_wait_seconds = seconds;
    }
    if let Some(top_k) = args.top_k {
        config.top_k = top_k;
    }
    Ok(config)
}

fn run_request(args: &RunArgs, dataset: &Dataset) -> RunRequest {
    let stages = if args.stages.is_empty() {
        all_stages()
    } else {
        args.stages.iter().map(|stage| stage.as_stage()).collect()
    };

    let mut excluded_categories = declared_filter_categories(dataset);
    excluded_categories.extend(
        args.filter_categories
            .iter()
            .map(|category| category.trim().to_string())
            .filter(|category| !category.is_empty()),
    );

    let smoke_test = args.smoke.then_some(SmokeTest {
        message_count: args.smoke_messages,
        question_count: args.smoke_questions,
    });

    RunRequest {
        stages,
        smoke_test,
        excluded_categories,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use clap::Parser;
    use serde_json::json;

    use super::*;
    use crate::cli::{Cli, Commands};
    use crate::pipeline::Stage;

    fn args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["membench", "run", "dataset.json"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).expect("arguments should parse").command {
            Commands::Run(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn request_merges_dataset_and_cli_categories() {
        let mut dataset = Dataset {
            dataset_name: "locomo".to_string(),
            conversations: Vec::new(),
            qa_pairs: Vec::new(),
            metadata: Default::default(),
        };
        dataset
            .metadata
            .insert("filter_categories".to_string(), json!([5]));

        let request = run_request(
            &args(&["--filter-category", "3", "--stage", "search"]),
            &dataset,
        );

        assert_eq!(
            request.excluded_categories,
            BTreeSet::from(["3".to_string(), "5".to_string()])
        );
        assert_eq!(request.stages, [Stage::Search].into_iter().collect());
        assert!(request.smoke_test.is_none());
    }

    #[test]
    fn cli_overrides_adapter_config_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("adapter.json");
        fs::write(&path, r#"{"post_add_wait_seconds": 30, "top_k": 4}"#).expect("write config");

        let path_arg = path.to_string_lossy().into_owned();
        let config = adapter_config(&args(&[
            "--adapter-config",
            &path_arg,
            "--post-add-wait-seconds",
            "0",
        ]))
        .expect("config");

        assert_eq!(config.post_add_wait_seconds, 0);
        assert_eq!(config.top_k, 4);
    }
}
