use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::error::PipelineError;
use crate::util::{ensure_directory, write_atomic, write_json_pretty};

/// Named JSON artifacts under one output directory.
#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn new(root: &Path) -> Result<Self> {
        ensure_directory(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).is_file()
    }

    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.path(name);
        write_json_pretty(&path, value)?;
        debug!(path = %path.display(), "saved artifact");
        Ok(())
    }

    pub fn save_text(&self, name: &str, text: &str) -> Result<()> {
        write_atomic(&self.path(name), text.as_bytes())
    }

    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let path = self.path(name);
        let raw =
            fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let value = serde_json::from_slice(&raw).map_err(|err| PipelineError::CorruptArtifact {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        Ok(value)
    }

    /// Like [`ResultStore::load`], but a missing artifact is `None` instead of an error.
    pub fn load_optional<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        if !self.exists(name) {
            return Ok(None);
        }
        self.load(name).map(Some)
    }
}
