mod adapters;
mod answer;
mod cli;
mod commands;
mod evaluate;
mod model;
mod pipeline;
mod util;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::pipeline::PipelineError;

fn main() {
    init_tracing();

    if let Err(err) = run() {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(exit_code(&err));
    }
}

/// Missing prerequisites exit with 2 so scripts can tell them apart from stage failures.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::MissingPrerequisite { .. }) => 2,
        Some(PipelineError::Cancelled { .. }) => 130,
        _ => 1,
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => commands::run::run(args),
        Commands::Status(args) => commands::status::run(args),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
