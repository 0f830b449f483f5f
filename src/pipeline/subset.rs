use std::collections::BTreeSet;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::model::{Dataset, normalize_category};
use crate::util::sha256_hex;

/// Smoke-test limits; zero keeps everything.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SmokeTest {
    pub message_count: usize,
    pub question_count: usize,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SmokeSummary {
    pub conversation_id: String,
    pub messages_kept: usize,
    pub messages_total: usize,
    pub questions_kept: usize,
    pub questions_total: usize,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FilterSummary {
    pub removed: usize,
    pub remaining: usize,
    pub categories: Vec<String>,
}

/// Keeps the first conversation, its first `message_count` messages and the first
/// `question_count` questions that belong to it. Returns `None` for an empty dataset.
pub fn apply_smoke_test(dataset: &Dataset, smoke: SmokeTest) -> Option<(Dataset, SmokeSummary)> {
    let first = dataset.conversations.first()?;
    let conversation_id = first.conversation_id.clone();

    let mut conversation = first.clone();
    let messages_total = conversation.messages.len();
    if smoke.message_count > 0 {
        conversation.messages.truncate(smoke.message_count);
    }

    let owned_questions = dataset
        .qa_pairs
        .iter()
        .filter(|qa| qa.conversation_id() == Some(conversation_id.as_str()));
    let questions_total = owned_questions.clone().count();
    let take = if smoke.question_count > 0 {
        smoke.question_count
    } else {
        usize::MAX
    };
    let qa_pairs = owned_questions.take(take).cloned().collect::<Vec<_>>();

    let summary = SmokeSummary {
        conversation_id,
        messages_kept: conversation.messages.len(),
        messages_total,
        questions_kept: qa_pairs.len(),
        questions_total,
    };

    let mut metadata = dataset.metadata.clone();
    metadata.insert("smoke_test".to_string(), Value::Bool(true));
    metadata.insert(
        "smoke_messages".to_string(),
        Value::from(summary.messages_kept),
    );
    metadata.insert(
        "smoke_questions".to_string(),
        Value::from(summary.questions_kept),
    );

    let truncated = Dataset {
        dataset_name: format!("{}_smoke", dataset.dataset_name),
        conversations: vec![conversation],
        qa_pairs,
        metadata,
    };

    Some((truncated, summary))
}

/// Drops every question whose category is in `excluded`, preserving the order of the rest.
pub fn filter_categories(dataset: &Dataset, excluded: &BTreeSet<String>) -> (Dataset, FilterSummary) {
    let qa_pairs = dataset
        .qa_pairs
        .iter()
        .filter(|qa| !excluded.contains(qa.category.as_str()))
        .cloned()
        .collect::<Vec<_>>();

    let summary = FilterSummary {
        removed: dataset.qa_pairs.len() - qa_pairs.len(),
        remaining: qa_pairs.len(),
        categories: excluded.iter().cloned().collect(),
    };

    let filtered = Dataset {
        dataset_name: dataset.dataset_name.clone(),
        conversations: dataset.conversations.clone(),
        qa_pairs,
        metadata: dataset.metadata.clone(),
    };

    (filtered, summary)
}

/// Categories a dataset asks to exclude through `metadata.filter_categories`.
pub fn declared_filter_categories(dataset: &Dataset) -> BTreeSet<String> {
    dataset
        .metadata
        .get("filter_categories")
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .map(normalize_category)
                .filter(|category| !category.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

pub fn dataset_fingerprint(dataset: &Dataset) -> Result<String> {
    let bytes = serde_json::to_vec(dataset).context("failed to serialize dataset for fingerprint")?;
    Ok(sha256_hex(&bytes))
}
