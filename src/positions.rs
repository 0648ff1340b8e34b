//! Loading and saving the stream position across runs.

use anyhow::{Context, Result};
use checkpoint::{load_latest_checkpoint, save_checkpoint, Checkpoint, FilesystemStore, SyncPhase};
use sync_core::StreamPosition;
use tracing::{info, warn};

use crate::CheckpointOpts;

/// Position the first stream instance should start from.
///
/// An explicit `--resume-from` wins over the checkpoint directory. `None`
/// starts at the end of the log.
pub async fn resolve_resume_position(opts: &CheckpointOpts) -> Result<Option<StreamPosition>> {
    if let Some(position) = &opts.resume_from {
        let position = StreamPosition::from_cli_string(position)
            .with_context(|| format!("Invalid --resume-from '{position}'"))?;
        info!("Resuming from {position}");
        return Ok(Some(position));
    }

    let Some(dir) = &opts.checkpoint_dir else {
        return Ok(None);
    };
    let store = FilesystemStore::new(dir);
    match load_latest_checkpoint::<StreamPosition>(&store).await? {
        Some((position, phase)) => {
            info!("Resuming from {phase} checkpoint {position}");
            Ok(Some(position))
        }
        None => {
            info!("No checkpoint in {}, starting at the end of the log", dir.display());
            Ok(None)
        }
    }
}

/// Write `position` to the checkpoint directory, if one was configured.
pub async fn persist_position(
    opts: &CheckpointOpts,
    position: Option<StreamPosition>,
    phase: SyncPhase,
) -> Result<()> {
    let Some(dir) = &opts.checkpoint_dir else {
        return Ok(());
    };
    let Some(position) = position else {
        warn!("No stream position known yet, nothing to checkpoint");
        return Ok(());
    };
    save_checkpoint(&FilesystemStore::new(dir), &position, phase).await
}
