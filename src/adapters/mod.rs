use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::model::{Conversation, Metadata, SearchResult};

mod sqlite_memory;

pub use sqlite_memory::{DB_FILE_NAME as SQLITE_DB_FILE_NAME, SqliteMemoryAdapter};

pub const DEFAULT_TOP_K: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Seconds to sleep after ingestion before searching. A fixed delay for backends that
    /// index asynchronously; it does not prove the backend is ready.
    #[serde(default)]
    pub post_add_wait_seconds: u64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(flatten)]
    pub extra: Metadata,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            post_add_wait_seconds: 0,
            top_k: DEFAULT_TOP_K,
            extra: Metadata::new(),
        }
    }
}

impl AdapterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse adapter config {}", path.display()))
    }
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    pub top_k: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemInfo {
    pub name: String,
    pub version: String,
    pub details: Metadata,
}

/// Handle an adapter needs between ingestion and search, rebuilt on every run.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHandle {
    pub location: Option<PathBuf>,
    pub metadata: Metadata,
}

/// Ingest/search capability of one memory system.
pub trait MemoryAdapter {
    /// Ingests the conversations and returns free-form ingestion metadata.
    fn add(&self, conversations: &[Conversation]) -> Result<Metadata>;

    /// Reopens or rebuilds whatever search needs. Hosted systems return `None`.
    fn build_or_recover_index(
        &self,
        conversations: &[Conversation],
        output_dir: &Path,
    ) -> Result<Option<IndexHandle>>;

    fn search(
        &self,
        query: &str,
        conversation_id: &str,
        index: Option<&IndexHandle>,
        options: &SearchOptions,
    ) -> Result<SearchResult>;

    fn system_info(&self) -> SystemInfo;

    fn config(&self) -> &AdapterConfig;
}

pub fn build_adapter(
    system: &str,
    config: AdapterConfig,
    output_dir: &Path,
) -> Result<Box<dyn MemoryAdapter>> {
    match system.trim().to_ascii_lowercase().as_str() {
        "sqlite-fts" | "sqlite" | "local" => Ok(Box::new(SqliteMemoryAdapter::new(
            config, output_dir,
        )?)),
        other => bail!("unknown memory system: {other} (available: sqlite-fts)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn adapter_config_fills_defaults_and_keeps_extra_keys() {
        let config: AdapterConfig = serde_json::from_value(json!({
            "post_add_wait_seconds": 30,
            "agent_id": "bench"
        }))
        .expect("config should deserialize");

        assert_eq!(config.post_add_wait_seconds, 30);
        assert_eq!(config.top_k, DEFAULT_TOP_K);
        assert_eq!(config.extra.get("agent_id"), Some(&json!("bench")));
    }

    #[test]
    fn unknown_system_is_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let error = build_adapter("memu", AdapterConfig::default(), dir.path())
            .err()
            .expect("unknown system should fail");
        assert!(error.to_string().contains("unknown memory system"));
    }
}
