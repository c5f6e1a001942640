//! Session checkpoints on disk.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use mockprep_core::error::StoreError;
use mockprep_core::model::Checkpoint;
use mockprep_core::traits::ProgressStore;

use crate::{blocking, file_name, read_optional, remove_optional, write_atomic};

/// One pretty-printed JSON checkpoint per session, named after the session id.
#[derive(Debug, Clone)]
pub struct FileProgressStore {
    dir: PathBuf,
}

impl FileProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(file_name(session_id))
    }

    /// Session ids with a checkpoint on disk.
    pub async fn list(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.dir.clone();
        blocking(move || {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let mut ids = Vec::new();
            for entry in entries {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(bytes) = read_optional(&path)? else {
                    continue;
                };
                match serde_json::from_slice::<Checkpoint>(&bytes) {
                    Ok(checkpoint) => ids.push(checkpoint.session_id),
                    Err(e) => tracing::warn!("skipping unreadable checkpoint {}: {e}", path.display()),
                }
            }
            ids.sort();
            Ok(ids)
        })
        .await
    }
}

#[async_trait]
impl ProgressStore for FileProgressStore {
    async fn get(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let path = self.path_for(session_id);
        let bytes = blocking(move || read_optional(&path)).await?;
        match bytes {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        let dir = self.dir.clone();
        let name = file_name(&checkpoint.session_id);
        blocking(move || write_atomic(&dir, &name, &bytes)).await?;
        tracing::debug!(
            session_id = %checkpoint.session_id,
            index = checkpoint.current_index,
            "checkpoint written"
        );
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Result<(), StoreError> {
        let path = self.path_for(session_id);
        blocking(move || remove_optional(&path)).await
    }
}
