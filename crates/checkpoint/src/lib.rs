//! Checkpoint management for live-sync
//!
//! Persists the change stream's resumable position so a later run can pick
//! up where the previous one stopped instead of starting at the end of the
//! log.
//!
//! - [`Checkpoint`] is implemented by each source's position type
//! - [`CheckpointFile`] is the storage-agnostic, self-describing wrapper
//! - [`CheckpointStore`] abstracts the backend; [`FilesystemStore`] writes JSON files

mod file;
mod filesystem;
mod phase;
pub mod store;


pub use file::CheckpointFile;
pub use filesystem::FilesystemStore;
pub use phase::SyncPhase;
pub use store::{CheckpointID, CheckpointStore, StoredCheckpoint};

/// Trait that source-specific positions implement.
///
/// # Example
///
/// ```rust
/// use checkpoint::Checkpoint;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct LogOffset {
///     pub offset: u64,
/// }
///
/// impl Checkpoint for LogOffset {
///     const DATABASE_TYPE: &'static str = "mylog";
///
///     fn to_cli_string(&self) -> String {
///         self.offset.to_string()
///     }
///
///     fn from_cli_string(s: &str) -> anyhow::Result<Self> {
///         Ok(Self { offset: s.parse()? })
///     }
/// }
/// ```
pub trait Checkpoint: serde::Serialize + for<'de> serde::Deserialize<'de> + Clone {
    /// Source type identifier, stored alongside the data and checked on load.
    const DATABASE_TYPE: &'static str;

    /// CLI-friendly form, parseable by `from_cli_string()`.
    fn to_cli_string(&self) -> String;

    fn from_cli_string(s: &str) -> anyhow::Result<Self>
    where
        Self: Sized;
}

/// Save `checkpoint` under `phase`.
pub async fn save_checkpoint<C: Checkpoint>(
    store: &dyn CheckpointStore,
    checkpoint: &C,
    phase: SyncPhase,
) -> anyhow::Result<()> {
    let id = CheckpointID {
        database_type: C::DATABASE_TYPE.to_string(),
        phase: phase.as_str().to_string(),
    };
    store
        .store_checkpoint(&id, serde_json::to_string(checkpoint)?)
        .await?;
    tracing::info!("Saved {phase} checkpoint: {}", checkpoint.to_cli_string());
    Ok(())
}

/// Load the newest checkpoint of type `C` across all phases.
///
/// Returns `None` when nothing has been stored yet.
pub async fn load_latest_checkpoint<C: Checkpoint>(
    store: &dyn CheckpointStore,
) -> anyhow::Result<Option<(C, SyncPhase)>> {
    let mut newest: Option<CheckpointFile> = None;

    for phase in SyncPhase::all() {
        let id = CheckpointID {
            database_type: C::DATABASE_TYPE.to_string(),
            phase: phase.as_str().to_string(),
        };
        if let Some(stored) = store.read_checkpoint(&id).await? {
            let file = CheckpointFile::from_stored(stored)?;
            if newest
                .as_ref()
                .map_or(true, |current| file.created_at > current.created_at)
            {
                newest = Some(file);
            }
        }
    }

    match newest {
        Some(file) => Ok(Some((file.parse()?, file.phase))),
        None => Ok(None),
    }
}
