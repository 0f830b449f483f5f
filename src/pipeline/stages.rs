use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::debug;

use super::error::PipelineError;
use crate::adapters::{IndexHandle, MemoryAdapter, SearchOptions};
use crate::answer::AnswerProvider;
use crate::evaluate::Evaluator;
use crate::model::{AnswerResult, Dataset, EvaluationResult, Metadata, QaPair, SearchResult};

pub struct AddOutcome {
    pub ingestion: Metadata,
    pub index: Option<IndexHandle>,
}

pub fn run_add_stage(
    adapter: &dyn MemoryAdapter,
    dataset: &Dataset,
    output_dir: &Path,
) -> Result<AddOutcome> {
    let ingestion = adapter
        .add(&dataset.conversations)
        .context("memory adapter failed to ingest conversations")?;
    let index = adapter
        .build_or_recover_index(&dataset.conversations, output_dir)
        .context("memory adapter failed to build its index")?;

    Ok(AddOutcome { ingestion, index })
}

pub fn run_search_stage(
    adapter: &dyn MemoryAdapter,
    qa_pairs: &[QaPair],
    index: Option<&IndexHandle>,
    options: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    let mut results = Vec::with_capacity(qa_pairs.len());

    for (position, qa) in qa_pairs.iter().enumerate() {
        let conversation_id = owning_conversation(qa, position)?;
        let result = adapter
            .search(&qa.question, conversation_id, index, options)
            .with_context(|| format!("search failed for question {:?}", qa.question))?;
        debug!(
            conversation = %conversation_id,
            hits = result.results.len(),
            "searched question"
        );
        results.push(result);
    }

    Ok(results)
}

pub fn run_answer_stage(
    provider: &dyn AnswerProvider,
    qa_pairs: &[QaPair],
    search_results: &[SearchResult],
) -> Result<Vec<AnswerResult>> {
    let by_question = search_results
        .iter()
        .map(|result| {
            (
                (result.conversation_id.as_str(), result.query.as_str()),
                result,
            )
        })
        .collect::<HashMap<_, _>>();

    let mut answers = Vec::with_capacity(qa_pairs.len());

    for (position, qa) in qa_pairs.iter().enumerate() {
        let conversation_id = owning_conversation(qa, position)?;
        let question_id = question_id_for(qa, conversation_id, position);

        let Some(search) = by_question.get(&(conversation_id, qa.question.as_str())) else {
            return Err(PipelineError::MismatchedResults {
                question_id,
                conversation_id: conversation_id.to_string(),
            }
            .into());
        };

        let formatted_context = search.formatted_context();
        let answer = provider
            .answer(&qa.question, &formatted_context)
            .with_context(|| format!("answer provider failed for question {question_id}"))?;

        let mut metadata = Metadata::new();
        metadata.insert("provider".to_string(), json!(provider.name()));
        metadata.insert("retrieved_count".to_string(), json!(search.results.len()));

        answers.push(AnswerResult {
            question_id,
            question: qa.question.clone(),
            answer,
            golden_answer: qa.golden_answer.clone(),
            category: qa.category.clone(),
            conversation_id: conversation_id.to_string(),
            formatted_context,
            metadata,
        });
    }

    Ok(answers)
}

pub fn run_evaluate_stage(
    evaluator: &dyn Evaluator,
    answers: &[AnswerResult],
) -> Result<EvaluationResult> {
    evaluator
        .evaluate(answers)
        .with_context(|| format!("evaluator {} failed", evaluator.name()))
}

fn owning_conversation(qa: &QaPair, position: usize) -> Result<&str> {
    qa.conversation_id().with_context(|| {
        format!(
            "question {position} ({:?}) has no conversation_id in its metadata",
            qa.question
        )
    })
}

fn question_id_for(qa: &QaPair, conversation_id: &str, position: usize) -> String {
    if qa.question_id.is_empty() {
        format!("{conversation_id}_q{position}")
    } else {
        qa.question_id.clone()
    }
}
