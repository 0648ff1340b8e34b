//! Engine configuration.

use std::time::Duration;

use sync_core::StreamPosition;

/// Timing of the change stream's connect/reconnect cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// How long a freshly opened stream may take to report ready.
    pub init_timeout: Duration,
    /// Wait before every reconnect attempt except the first, which is immediate.
    pub reconnect_delay: Duration,
    /// Consecutive failed reconnects tolerated before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(2),
            max_attempts: 3,
        }
    }
}

impl ReconnectPolicy {
    /// Backoff before reconnect attempt number `attempts_so_far + 1`.
    pub fn delay_for(&self, attempts_so_far: u32) -> Duration {
        if attempts_so_far == 0 {
            Duration::ZERO
        } else {
            self.reconnect_delay
        }
    }
}

/// Configuration of a [`crate::LiveSync`] connection.
#[derive(Debug, Clone, Default)]
pub struct LiveConfig {
    /// Replication identity passed to the change stream.
    pub server_id: u32,
    /// Default throttle for new query caches; `select` may override it.
    pub min_interval: Option<Duration>,
    /// Re-evaluate trigger conditions for caches that already have a refresh queued.
    pub check_condition_when_queued: bool,
    /// Schema used for triggers and mirrors that do not name one.
    pub default_schema: Option<String>,
    /// Position the first stream instance starts from instead of the end of the log.
    pub resume_from: Option<StreamPosition>,
    pub reconnect: ReconnectPolicy,
}

impl LiveConfig {
    pub fn new(server_id: u32) -> Self {
        Self {
            server_id,
            ..Self::default()
        }
    }

    pub fn with_default_schema(mut self, schema: impl Into<String>) -> Self {
        self.default_schema = Some(schema.into());
        self
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = Some(min_interval);
        self
    }
}
