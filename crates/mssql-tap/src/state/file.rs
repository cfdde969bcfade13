//! File-backed state store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::backend::StateStore;
use super::State;
use crate::error::Result;

/// Persist state as a JSON file, replacing it atomically on every save.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<Option<State>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(State::from_json(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, state: &State) -> Result<()> {
        let content = serde_json::to_string_pretty(state)?;

        // Atomic write: write to temp file, then rename
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &content).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;

        debug!("Saved state to {}", self.path.display());
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}
