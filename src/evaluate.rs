use std::collections::BTreeMap;

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::json;

use crate::model::{AnswerResult, EvaluationResult, Metadata, accuracy};

/// Scores generated answers against golden answers.
pub trait Evaluator {
    fn name(&self) -> &str;

    fn evaluate(&self, answers: &[AnswerResult]) -> Result<EvaluationResult>;
}

/// Marks an answer correct when its normalised text contains the normalised golden answer.
pub struct LexicalMatchEvaluator {
    punctuation: Regex,
}

impl LexicalMatchEvaluator {
    pub fn new() -> Result<Self> {
        let punctuation =
            Regex::new(r"[^\p{L}\p{N}\s]").context("failed to compile punctuation regex")?;
        Ok(Self { punctuation })
    }

    fn normalize(&self, text: &str) -> String {
        let lowered = text.to_lowercase();
        let stripped = self.punctuation.replace_all(&lowered, " ");
        stripped.split_whitespace().collect::<Vec<&str>>().join(" ")
    }

    fn is_correct(&self, answer: &str, golden: &str) -> bool {
        let golden = self.normalize(golden);
        if golden.is_empty() {
            return false;
        }
        let answer = format!(" {} ", self.normalize(answer));
        answer.contains(&format!(" {golden} "))
    }
}

impl Evaluator for LexicalMatchEvaluator {
    fn name(&self) -> &str {
        "lexical-match"
    }

    fn evaluate(&self, answers: &[AnswerResult]) -> Result<EvaluationResult> {
        let mut correct = 0usize;
        let mut per_category = BTreeMap::<&str, (usize, usize)>::new();
        let mut detailed = Vec::with_capacity(answers.len());

        for result in answers {
            let is_correct = self.is_correct(&result.answer, &result.golden_answer);
            if is_correct {
                correct += 1;
            }

            let entry = per_category.entry(result.category.as_str()).or_default();
            entry.0 += 1;
            if is_correct {
                entry.1 += 1;
            }

            detailed.push(json!({
                "question_id": result.question_id,
                "question": result.question,
                "answer": result.answer,
                "golden_answer": result.golden_answer,
                "category": result.category,
                "is_correct": is_correct,
            }));
        }

        let mut category_accuracy = Metadata::new();
        for (category, (total, hits)) in per_category {
            category_accuracy.insert(
                category.to_string(),
                json!({
                    "total": total,
                    "correct": hits,
                    "accuracy": accuracy(hits, total),
                }),
            );
        }

        let mut metadata = Metadata::new();
        metadata.insert("evaluator".to_string(), json!(self.name()));
        metadata.insert("category_accuracy".to_string(), category_accuracy.into());

        Ok(EvaluationResult::from_counts(
            answers.len(),
            correct,
            detailed,
            metadata,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer(category: &str, answer: &str, golden: &str) -> AnswerResult {
        AnswerResult {
            question_id: format!("q-{category}-{golden}"),
            question: "question".to_string(),
            answer: answer.to_string(),
            golden_answer: golden.to_string(),
            category: category.to_string(),
            conversation_id: "conv-1".to_string(),
            formatted_context: String::new(),
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn containment_ignores_case_and_punctuation() {
        let evaluator = LexicalMatchEvaluator::new().expect("evaluator");
        assert!(evaluator.is_correct("She moved to LISBON, Portugal.", "lisbon"));
        assert!(!evaluator.is_correct("She moved to Lisbonne", "lisbon"));
        assert!(!evaluator.is_correct("anything", "  "));
    }

    #[test]
    fn evaluation_counts_and_breaks_down_by_category() {
        let evaluator = LexicalMatchEvaluator::new().expect("evaluator");
        let answers = vec![
            answer("1", "A cat named Miso", "Miso"),
            answer("1", "No idea", "Lisbon"),
            answer("2", "In May 2023", "May 2023"),
        ];

        let result = evaluator.evaluate(&answers).expect("evaluate");
        assert_eq!(result.total_questions, 3);
        assert_eq!(result.correct, 2);
        assert_eq!(result.detailed_results.len(), 3);
        assert_eq!(result.detailed_results[1]["is_correct"], json!(false));
        assert_eq!(
            result.metadata["category_accuracy"]["1"]["accuracy"],
            json!(0.5)
        );
    }

    #[test]
    fn empty_answers_score_zero_accuracy() {
        let evaluator = LexicalMatchEvaluator::new().expect("evaluator");
        let result = evaluator.evaluate(&[]).expect("evaluate");
        assert_eq!(result.total_questions, 0);
        assert_eq!(result.accuracy, 0.0);
    }
}
