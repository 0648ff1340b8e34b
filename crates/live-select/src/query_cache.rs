//! Per-query cache entry.
//!
//! One entry exists per distinct `(query, params, key selector)` and is shared
//! by every subscription that asked for it. The entry owns the current
//! snapshot, the throttle bookkeeping and the single-flight flags; the engine
//! owns the timers and execution tasks and reports back through
//! [`QueryCache::finish_execution`].

use std::sync::Arc;
use std::time::Duration;

use sync_core::{diff, ChangeEvent, Diff, KeyError, KeySelector, Row, Snapshot, Trigger, Value};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::subscription::{SelectEvent, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct EntryId(pub u64);

pub(crate) struct Subscriber {
    pub id: SubscriptionId,
    pub triggers: Vec<Trigger>,
    pub tx: mpsc::UnboundedSender<SelectEvent>,
}

/// What a refresh request should do right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Plan {
    Execute,
    /// Throttled: arm the refresh timer for this instant.
    Wait(Instant),
    /// Throttled and a timer is already armed.
    Queued,
}

pub(crate) struct QueryCache {
    pub id: EntryId,
    pub cache_key: String,
    pub query: String,
    pub params: Vec<Value>,
    pub keys: KeySelector,
    pub min_interval: Option<Duration>,
    pub data: Arc<Snapshot>,
    /// At least one execution succeeded.
    pub initialized: bool,
    pub in_flight: bool,
    /// A refresh was requested while an execution was in flight.
    pub pending: bool,
    pub last_start: Option<Instant>,
    pub timer: Option<AbortHandle>,
    /// Incremented on every delivered update.
    pub update_seq: u64,
    pub subscribers: Vec<Subscriber>,
}

impl QueryCache {
    pub fn new(
        id: EntryId,
        cache_key: String,
        query: String,
        params: Vec<Value>,
        keys: KeySelector,
        min_interval: Option<Duration>,
    ) -> Self {
        Self {
            id,
            cache_key,
            query,
            params,
            keys,
            min_interval,
            data: Arc::new(Snapshot::new()),
            initialized: false,
            in_flight: false,
            pending: false,
            last_start: None,
            timer: None,
            update_seq: 0,
            subscribers: Vec::new(),
        }
    }

    pub fn plan(&self, now: Instant) -> Plan {
        let (Some(interval), Some(last_start)) = (self.min_interval, self.last_start) else {
            return Plan::Execute;
        };
        // An armed timer owns the next execution, even if it is already due.
        if self.timer.is_some() {
            return Plan::Queued;
        }
        let due = last_start + interval;
        if now >= due {
            Plan::Execute
        } else {
            Plan::Wait(due)
        }
    }

    /// Mark an execution as started. Returns `false` (and remembers the
    /// request) when one is already in flight.
    pub fn begin_execution(&mut self, now: Instant) -> bool {
        if self.in_flight {
            self.pending = true;
            return false;
        }
        self.in_flight = true;
        self.pending = false;
        self.last_start = Some(now);
        true
    }

    /// Record the outcome of the in-flight execution and notify subscribers.
    ///
    /// Returns `true` when a refresh was requested while it ran.
    pub fn finish_execution(&mut self, result: anyhow::Result<Vec<Row>>) -> bool {
        self.in_flight = false;

        let outcome = result
            .and_then(|rows| build_snapshot(&self.keys, rows).map_err(anyhow::Error::from));
        match outcome {
            Ok(snapshot) => {
                let diff = if snapshot.is_empty() && !self.initialized {
                    Diff::initial(Snapshot::new())
                } else {
                    diff(&self.data, &snapshot)
                };
                let data = Arc::new(snapshot);
                self.data = data.clone();
                self.initialized = true;
                self.update_seq += 1;
                self.broadcast(SelectEvent::Update {
                    diff: Arc::new(diff),
                    data,
                });
            }
            Err(err) => {
                tracing::warn!("Live select failed: {err:#}");
                self.broadcast(SelectEvent::Error(Arc::new(err)));
            }
        }

        std::mem::take(&mut self.pending)
    }

    /// `true` if any subscriber's triggers match `event`.
    pub fn matches(&self, event: &ChangeEvent, default_schema: Option<&str>) -> bool {
        self.subscribers
            .iter()
            .any(|s| sync_core::trigger::matches(event, &s.triggers, default_schema))
    }

    pub fn subscriber(&self, id: SubscriptionId) -> Option<&Subscriber> {
        self.subscribers.iter().find(|s| s.id == id)
    }

    fn broadcast(&self, event: SelectEvent) {
        for subscriber in &self.subscribers {
            // A closed receiver means the handle is being dropped; it
            // detaches itself.
            let _ = subscriber.tx.send(event.clone());
        }
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Key every row; on duplicate keys the later row wins.
pub(crate) fn build_snapshot(keys: &KeySelector, rows: Vec<Row>) -> Result<Snapshot, KeyError> {
    let mut snapshot = Snapshot::new();
    for (index, row) in rows.into_iter().enumerate() {
        let key = keys.key_for(&row, index)?;
        snapshot.insert(key, row);
    }
    Ok(snapshot)
}

/// Dedup key of a live select: canonical JSON of query, values and selector tag.
pub(crate) fn cache_key(query: &str, params: &[Value], keys: &KeySelector) -> String {
    sync_core::canonical_json(&serde_json::json!({
        "query": query,
        "values": params,
        "keySelector": keys.tag(),
    }))
}
