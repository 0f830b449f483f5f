use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::PipelineError;
use super::stage::StageSet;
use crate::model::{AnswerResult, EvaluationResult, SearchResult};
use crate::util::{now_utc_string, sha256_hex, write_json_pretty};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub run_name: String,
    pub updated_at: String,
    pub completed_stages: StageSet,
    #[serde(default)]
    pub dataset_fingerprint: Option<String>,
    #[serde(default)]
    pub search_results: Option<Vec<SearchResult>>,
    #[serde(default)]
    pub answer_results: Option<Vec<AnswerResult>>,
    #[serde(default)]
    pub eval_results: Option<EvaluationResult>,
}

/// Intermediate results to snapshot alongside the completed-stage set.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointSnapshot<'a> {
    pub dataset_fingerprint: Option<&'a str>,
    pub search_results: Option<&'a [SearchResult]>,
    pub answer_results: Option<&'a [AnswerResult]>,
    pub eval_results: Option<&'a EvaluationResult>,
}

#[derive(Serialize)]
struct CheckpointRecordRef<'a> {
    run_name: &'a str,
    updated_at: String,
    completed_stages: &'a StageSet,
    dataset_fingerprint: Option<&'a str>,
    search_results: Option<&'a [SearchResult]>,
    answer_results: Option<&'a [AnswerResult]>,
    eval_results: Option<&'a EvaluationResult>,
}

/// Durable per-run record of completed stages. Every save replaces the whole record, so
/// callers re-supply each result they still want kept.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    run_name: String,
    path: PathBuf,
}

impl CheckpointManager {
    pub fn new(output_dir: &Path, run_name: &str) -> Self {
        let path = output_dir.join(format!("checkpoint_{}.json", checkpoint_file_stem(run_name)));
        Self {
            run_name: run_name.to_string(),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn load(&self) -> Result<Option<CheckpointRecord>> {
        if !self.path.is_file() {
            return Ok(None);
        }

        let raw = fs::read(&self.path)
            .with_context(|| format!("failed to read checkpoint {}", self.path.display()))?;
        let record: CheckpointRecord =
            serde_json::from_slice(&raw).map_err(|err| PipelineError::CorruptArtifact {
                path: self.path.clone(),
                reason: err.to_string(),
            })?;

        if record.run_name != self.run_name {
            return Err(PipelineError::CorruptArtifact {
                path: self.path.clone(),
                reason: format!(
                    "checkpoint belongs to run {:?}, not {:?}",
                    record.run_name, self.run_name
                ),
            }
            .into());
        }

        debug!(
            path = %self.path.display(),
            completed = record.completed_stages.len(),
            "loaded checkpoint"
        );
        Ok(Some(record))
    }

    pub fn save(&self, completed_stages: &StageSet, snapshot: CheckpointSnapshot<'_>) -> Result<()> {
        let record = CheckpointRecordRef {
            run_name: &self.run_name,
            updated_at: now_utc_string(),
            completed_stages,
            dataset_fingerprint: snapshot.dataset_fingerprint,
            search_results: snapshot.search_results,
            answer_results: snapshot.answer_results,
            eval_results: snapshot.eval_results,
        };
        write_json_pretty(&self.path, &record)
            .with_context(|| format!("failed to save checkpoint for run {}", self.run_name))
    }
}

/// Run names that are not already file-safe get a short hash of the raw name appended, so
/// "team/a" and "team_a" never share a checkpoint.
fn checkpoint_file_stem(run_name: &str) -> String {
    let cleaned = sanitize_run_name(run_name);
    if cleaned == run_name {
        return cleaned;
    }
    let digest = sha256_hex(run_name.as_bytes());
    format!("{cleaned}_{}", &digest[..8])
}

fn sanitize_run_name(run_name: &str) -> String {
    let cleaned: String = run_name
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Metadata, RetrievedMemory};
    use crate::pipeline::stage::{Stage, all_stages};
    use serde_json::json;

    fn search_result() -> SearchResult {
        let mut retrieval_metadata = Metadata::new();
        retrieval_metadata.insert("formatted_context".to_string(), json!("Ana: hi"));
        SearchResult {
            query: "Who said hi?".to_string(),
            conversation_id: "conv-1".to_string(),
            results: vec![RetrievedMemory {
                content: "Ana: hi".to_string(),
                score: 0.1 + 0.2,
                user_id: Some("conv-1_ana".to_string()),
                metadata: Metadata::new(),
                extra: Metadata::new(),
            }],
            retrieval_metadata,
        }
    }

    #[test]
    fn missing_checkpoint_loads_as_none() {
        let dir = tempfile::tempdir().expect("temp dir");
        let manager = CheckpointManager::new(dir.path(), "fresh");
        assert!(manager.load().expect("load").is_none());
    }

    #[test]
    fn save_then_load_restores_every_field() {
        let dir = tempfile::tempdir().expect("temp dir");
        let manager = CheckpointManager::new(dir.path(), "nightly");
        let searches = vec![search_result()];
        let answers = vec![AnswerResult {
            question_id: "conv-1_0".to_string(),
            question: "Who said hi?".to_string(),
            answer: "Ana".to_string(),
            golden_answer: "Ana".to_string(),
            category: "2".to_string(),
            conversation_id: "conv-1".to_string(),
            formatted_context: "Ana: hi".to_string(),
            metadata: Metadata::new(),
        }];
        let eval = EvaluationResult::from_counts(1, 1, vec![json!({"ok": true})], Metadata::new());

        manager
            .save(
                &all_stages(),
                CheckpointSnapshot {
                    dataset_fingerprint: Some("abc"),
                    search_results: Some(&searches),
                    answer_results: Some(&answers),
                    eval_results: Some(&eval),
                },
            )
            .expect("save");

        let record = manager.load().expect("load").expect("record present");
        assert_eq!(record.run_name, "nightly");
        assert_eq!(record.completed_stages, all_stages());
        assert_eq!(record.dataset_fingerprint.as_deref(), Some("abc"));
        assert_eq!(record.search_results, Some(searches));
        assert_eq!(record.answer_results, Some(answers));
        assert_eq!(record.eval_results, Some(eval));
    }

    #[test]
    fn save_replaces_rather_than_merges() {
        let dir = tempfile::tempdir().expect("temp dir");
        let manager = CheckpointManager::new(dir.path(), "replace");
        let searches = vec![search_result()];
        let add_and_search: StageSet = [Stage::Add, Stage::Search].into_iter().collect();

        manager
            .save(
                &add_and_search,
                CheckpointSnapshot {
                    search_results: Some(&searches),
                    ..CheckpointSnapshot::default()
                },
            )
            .expect("first save");
        manager
            .save(&add_and_search, CheckpointSnapshot::default())
            .expect("second save");

        let record = manager.load().expect("load").expect("record present");
        assert!(record.search_results.is_none());
    }

    #[test]
    fn corrupt_checkpoint_is_fatal() {
        let dir = tempfile::tempdir().expect("temp dir");
        let manager = CheckpointManager::new(dir.path(), "broken");
        fs::write(manager.path(), b"{\"completed_stages\": [\"add\"").expect("write");

        let error = manager.load().expect_err("corrupt checkpoint must fail");
        assert!(matches!(
            error.downcast_ref::<PipelineError>(),
            Some(PipelineError::CorruptArtifact { .. })
        ));
    }

    #[test]
    fn run_names_are_sanitized_into_file_names() {
        let dir = tempfile::tempdir().expect("temp dir");
        let plain = CheckpointManager::new(dir.path(), "nightly-2024.05");
        assert!(plain.path().ends_with("checkpoint_nightly-2024.05.json"));

        let spaced = CheckpointManager::new(dir.path(), "team a/run 1");
        let file_name = spaced
            .path()
            .file_name()
            .and_then(|name| name.to_str())
            .expect("utf-8 file name");
        assert!(file_name.starts_with("checkpoint_team_a_run_1_"));
        assert!(file_name.ends_with(".json"));
    }

    #[test]
    fn run_names_that_sanitize_alike_keep_separate_checkpoints() {
        let dir = tempfile::tempdir().expect("temp dir");
        let slashed = CheckpointManager::new(dir.path(), "team/a");
        let underscored = CheckpointManager::new(dir.path(), "team_a");
        assert_ne!(slashed.path(), underscored.path());

        slashed
            .save(&all_stages(), CheckpointSnapshot::default())
            .expect("save");
        assert!(underscored.load().expect("load").is_none());
    }

    #[test]
    fn checkpoint_written_for_another_run_is_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let manager = CheckpointManager::new(dir.path(), "nightly");
        fs::write(
            manager.path(),
            r#"{"run_name":"weekly","updated_at":"2024-01-01T00:00:00Z","completed_stages":["add"]}"#,
        )
        .expect("write foreign checkpoint");

        let error = manager.load().expect_err("foreign checkpoint must not be reused");
        assert!(matches!(
            error.downcast_ref::<PipelineError>(),
            Some(PipelineError::CorruptArtifact { .. })
        ));
    }
}
