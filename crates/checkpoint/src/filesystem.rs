//! Filesystem-based checkpoint storage implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};

use crate::store::{CheckpointID, CheckpointStore, StoredCheckpoint};

/// Stores checkpoints as one JSON file per write in a directory.
///
/// Files are named `{database_type}_{phase}_{millis}.json` and written via a
/// temporary file plus rename, so a reader never observes a torn file.
pub struct FilesystemStore {
    dir: PathBuf,
}

impl FilesystemStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn prefix(id: &CheckpointID) -> String {
        format!("{}_{}_", id.database_type, id.phase)
    }
}

#[async_trait]
impl CheckpointStore for FilesystemStore {
    async fn store_checkpoint(&self, id: &CheckpointID, checkpoint_data: String) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let created_at = Utc::now();
        let stored = StoredCheckpoint {
            checkpoint_data,
            database_type: id.database_type.clone(),
            phase: id.phase.clone(),
            created_at,
        };

        let filename = self.dir.join(format!(
            "{}{}.json",
            Self::prefix(id),
            created_at.timestamp_millis()
        ));
        let tmp = filename.with_extension("json.tmp");

        std::fs::write(&tmp, serde_json::to_string_pretty(&stored)?)?;
        std::fs::rename(&tmp, &filename)?;
        tracing::info!("Stored checkpoint to {}", filename.display());
        Ok(())
    }

    async fn read_checkpoint(&self, id: &CheckpointID) -> Result<Option<StoredCheckpoint>> {
        if !self.dir.exists() {
            return Ok(None);
        }

        let prefix = Self::prefix(id);
        let mut latest: Option<StoredCheckpoint> = None;

        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let filename = entry.file_name().to_string_lossy().to_string();
            if !filename.starts_with(&prefix) || !filename.ends_with(".json") {
                continue;
            }

            let content = std::fs::read_to_string(entry.path())?;
            let stored: StoredCheckpoint = serde_json::from_str(&content)
                .with_context(|| format!("Corrupt checkpoint file {filename}"))?;

            if latest
                .as_ref()
                .map_or(true, |current| stored.created_at >= current.created_at)
            {
                latest = Some(stored);
            }
        }

        Ok(latest)
    }
}
