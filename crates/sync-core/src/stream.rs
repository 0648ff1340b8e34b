//! Contract of the change-data-capture stream consumed by the engine.
//!
//! A [`ChangeStreamSource`] opens independent stream instances. The engine
//! never reuses an instance after it failed: it stops it, drops its event
//! receiver and opens a fresh one, resuming from the failed instance's
//! [`position`](ChangeStream::position) when one was recorded.

use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::mpsc;

use crate::change::ChangeEvent;
use crate::position::StreamPosition;

/// Schema to table-set map restricting which tables a stream delivers.
///
/// An empty filter delivers nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaFilter {
    tables: BTreeMap<String, BTreeSet<String>>,
}

impl SchemaFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Include `schema.table`. Returns `true` if it was not included before.
    pub fn add(&mut self, schema: impl Into<String>, table: impl Into<String>) -> bool {
        self.tables
            .entry(schema.into())
            .or_default()
            .insert(table.into())
    }

    pub fn includes(&self, schema: &str, table: &str) -> bool {
        self.tables
            .get(schema)
            .is_some_and(|tables| tables.contains(table))
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(BTreeSet::is_empty)
    }

    /// `(schema, table)` pairs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tables
            .iter()
            .flat_map(|(s, tables)| tables.iter().map(move |t| (s.as_str(), t.as_str())))
    }
}

/// Parameters for opening one stream instance.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Replication identity of this consumer.
    pub server_id: u32,
    pub filter: SchemaFilter,
    /// Begin at the current end of the log. Ignored when `resume_from` is set.
    pub start_at_end: bool,
    pub resume_from: Option<StreamPosition>,
}

/// Notifications from a stream instance, in log order.
#[derive(Debug)]
pub enum StreamEvent {
    /// The instance is connected and delivering.
    Ready,
    Change(ChangeEvent),
    /// The instance failed and will deliver nothing further.
    Error(anyhow::Error),
}

pub type StreamEvents = mpsc::UnboundedReceiver<StreamEvent>;

/// Factory for stream instances.
pub trait ChangeStreamSource: Send + Sync {
    /// Open a new instance. Must be called from within a tokio runtime.
    fn open(&self, config: StreamConfig) -> (Box<dyn ChangeStream>, StreamEvents);
}

/// Control handle for one open stream instance.
pub trait ChangeStream: Send {
    /// Replace the delivery filter without reconnecting.
    fn set_filter(&mut self, filter: SchemaFilter);

    /// Last position consumed, once one is known.
    fn position(&self) -> Option<StreamPosition>;

    /// Stop delivering. Idempotent.
    fn stop(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_filter() {
        let mut filter = SchemaFilter::new();
        assert!(filter.is_empty());
        assert!(filter.add("app", "players"));
        assert!(!filter.add("app", "players"));
        assert!(filter.add("app", "teams"));
        assert!(filter.add("audit", "log"));

        assert!(filter.includes("app", "teams"));
        assert!(!filter.includes("audit", "players"));
        assert_eq!(
            filter.iter().collect::<Vec<_>>(),
            vec![("app", "players"), ("app", "teams"), ("audit", "log")]
        );
        assert!(SchemaFilter::new() != filter);
    }
}
