//! Stream lifecycle phase at which a checkpoint was taken.

use serde::{Deserialize, Serialize};

/// Point in the stream lifecycle where a position was captured.
///
/// Both phases describe a position that a later run can resume from; the
/// phase only records why the previous run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    /// Position captured during a user-initiated shutdown.
    StreamStopped,

    /// Position captured after the stream gave up reconnecting.
    ///
    /// Events after this position were never delivered, so resuming from it
    /// replays them.
    StreamFailed,
}

impl SyncPhase {
    /// Used for checkpoint file naming and log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::StreamStopped => "stream_stopped",
            SyncPhase::StreamFailed => "stream_failed",
        }
    }

    /// All phases, newest-first lookups scan these in order.
    pub fn all() -> [SyncPhase; 2] {
        [SyncPhase::StreamStopped, SyncPhase::StreamFailed]
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "stream_stopped" => Ok(SyncPhase::StreamStopped),
            "stream_failed" => Ok(SyncPhase::StreamFailed),
            other => Err(anyhow::anyhow!("Unknown sync phase: {other}")),
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
