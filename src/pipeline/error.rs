use std::path::PathBuf;

use thiserror::Error;

use super::stage::Stage;

/// Failures the orchestrator raises itself. Collaborator failures pass through untouched.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A later stage needs this stage's output, which is neither checkpointed nor persisted.
    #[error("missing prerequisite: {artifact} not found, run the '{stage}' stage first")]
    MissingPrerequisite { stage: Stage, artifact: String },
    /// A persisted artifact or checkpoint exists but cannot be decoded.
    #[error("corrupt artifact {}: {reason}", path.display())]
    CorruptArtifact { path: PathBuf, reason: String },
    /// The run was cancelled before `stage` started.
    #[error("run cancelled before stage '{stage}'")]
    Cancelled { stage: Stage },
    /// Search results do not cover a question the answer stage must process.
    #[error(
        "no search result for question {question_id:?} in conversation {conversation_id:?}; rerun the 'search' stage"
    )]
    MismatchedResults {
        question_id: String,
        conversation_id: String,
    },
}
