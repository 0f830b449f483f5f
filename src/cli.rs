use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::pipeline::Stage;

#[derive(Parser, Debug)]
#[command(
    name = "membench",
    version,
    about = "Benchmark pipeline for conversational memory systems"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the add, search, answer and evaluate stages against a dataset.
    Run(RunArgs),
    /// Show checkpoint and artifact state for a run.
    Status(StatusArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum StageArg {
    Add,
    Search,
    Answer,
    #[value(alias = "eval")]
    Evaluate,
}

impl StageArg {
    pub fn as_stage(self) -> Stage {
        match self {
            Self::Add => Stage::Add,
            Self::Search => Stage::Search,
            Self::Answer => Stage::Answer,
            Self::Evaluate => Stage::Evaluate,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Dataset JSON with conversations and qa_pairs.
    pub dataset: PathBuf,

    #[arg(long, default_value = "sqlite-fts")]
    pub system: String,

    /// Defaults to `results/<system>`.
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    #[arg(long, default_value = "default")]
    pub run_name: String,

    /// Stage to run; repeat for several. Defaults to every stage.
    #[arg(long = "stage", value_enum)]
    pub stages: Vec<StageArg>,

    #[arg(long, default_value_t = false)]
    pub smoke: bool,

    #[arg(long, default_value_t = 10)]
    pub smoke_messages: usize,

    #[arg(long, default_value_t = 3)]
    pub smoke_questions: usize,

    /// Question category to exclude; repeat for several.
    #[arg(long = "filter-category")]
    pub filter_categories: Vec<String>,

    #[arg(long, default_value_t = false)]
    pub no_checkpoint: bool,

    #[arg(long)]
    pub adapter_config: Option<PathBuf>,

    #[arg(long)]
    pub post_add_wait_seconds: Option<u64>,

    #[arg(long)]
    pub top_k: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = "sqlite-fts")]
    pub system: String,

    /// Defaults to `results/<system>`.
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    #[arg(long, default_value = "default")]
    pub run_name: String,
}

impl RunArgs {
    pub fn output_dir(&self) -> PathBuf {
        resolve_output_dir(self.output_dir.as_ref(), &self.system)
    }
}

impl StatusArgs {
    pub fn output_dir(&self) -> PathBuf {
        resolve_output_dir(self.output_dir.as_ref(), &self.system)
    }
}

fn resolve_output_dir(explicit: Option<&PathBuf>, system: &str) -> PathBuf {
    explicit
        .cloned()
        .unwrap_or_else(|| PathBuf::from("results").join(system))
}
