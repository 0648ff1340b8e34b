//! Typed view over a stored checkpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Checkpoint, StoredCheckpoint, SyncPhase};

/// Self-describing checkpoint wrapper.
///
/// ```json
/// {
///     "database_type": "mysql-audit",
///     "checkpoint": { "filename": "live_sync_changes", "offset": 42 },
///     "phase": "StreamStopped",
///     "created_at": "2024-01-01T00:00:00Z"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub database_type: String,
    pub checkpoint: serde_json::Value,
    pub phase: SyncPhase,
    pub created_at: DateTime<Utc>,
}

impl CheckpointFile {
    pub fn new<C: Checkpoint>(checkpoint: &C, phase: SyncPhase) -> anyhow::Result<Self> {
        Ok(Self {
            database_type: C::DATABASE_TYPE.to_string(),
            checkpoint: serde_json::to_value(checkpoint)?,
            phase,
            created_at: Utc::now(),
        })
    }

    /// Rebuild the typed wrapper from what a [`crate::CheckpointStore`] returned.
    pub fn from_stored(stored: StoredCheckpoint) -> anyhow::Result<Self> {
        Ok(Self {
            phase: SyncPhase::parse(&stored.phase)?,
            checkpoint: serde_json::from_str(&stored.checkpoint_data)?,
            database_type: stored.database_type,
            created_at: stored.created_at,
        })
    }

    /// Parse into the concrete checkpoint type, rejecting a foreign `database_type`.
    pub fn parse<C: Checkpoint>(&self) -> anyhow::Result<C> {
        if self.database_type != C::DATABASE_TYPE {
            anyhow::bail!(
                "Checkpoint type mismatch: expected '{}', found '{}'",
                C::DATABASE_TYPE,
                self.database_type
            );
        }
        Ok(serde_json::from_value(self.checkpoint.clone())?)
    }

    pub fn database_type(&self) -> &str {
        &self.database_type
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
