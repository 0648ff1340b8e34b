//! In-memory change stream and executor for tests.
//!
//! [`MemorySource`] hands out stream instances whose readiness, failures and
//! change events are driven by the test. [`MemoryTable`] is a tiny keyed
//! table that produces the change events matching each mutation, and
//! [`MemoryExecutor`] answers queries from a closure (typically reading a
//! `MemoryTable`).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use sync_core::values::value_key;
use sync_core::{
    ChangeEvent, ChangeStream, ChangeStreamSource, QueryExecutor, Row, RowPair, SchemaFilter,
    Snapshot, StreamConfig, StreamEvent, StreamEvents, StreamPosition, Value,
};
use tokio::sync::mpsc;

/// Log name reported in positions of memory streams.
pub const MEMORY_LOG: &str = "memory.log";

struct Instance {
    config: StreamConfig,
    filter: SchemaFilter,
    tx: Option<mpsc::UnboundedSender<StreamEvent>>,
    position: Option<StreamPosition>,
}

#[derive(Default)]
struct SourceState {
    instances: Vec<Instance>,
    auto_ready: bool,
    log_offset: u64,
}

/// Controllable [`ChangeStreamSource`]. Commands act on the most recently
/// opened instance.
#[derive(Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<SourceState>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instances report ready as soon as they are opened.
    pub fn auto_ready() -> Self {
        let source = Self::default();
        source.lock().auto_ready = true;
        source
    }

    fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send_latest(&self, event: StreamEvent) -> bool {
        let state = self.lock();
        match state.instances.last().and_then(|i| i.tx.as_ref()) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Number of instances opened so far.
    pub fn opened(&self) -> usize {
        self.lock().instances.len()
    }

    /// Configuration instance `n` (0-based) was opened with.
    pub fn config(&self, n: usize) -> Option<StreamConfig> {
        self.lock().instances.get(n).map(|i| i.config.clone())
    }

    /// Filter the latest instance currently applies.
    pub fn filter(&self) -> SchemaFilter {
        self.lock()
            .instances
            .last()
            .map(|i| i.filter.clone())
            .unwrap_or_default()
    }

    pub fn is_stopped(&self, n: usize) -> bool {
        self.lock().instances.get(n).is_some_and(|i| i.tx.is_none())
    }

    pub fn ready(&self) -> bool {
        self.send_latest(StreamEvent::Ready)
    }

    pub fn fail(&self, reason: &str) -> bool {
        self.send_latest(StreamEvent::Error(anyhow::anyhow!("{reason}")))
    }

    /// Deliver a change through the latest instance if its filter includes
    /// the table. Advances the log either way.
    pub fn push(&self, event: ChangeEvent) -> bool {
        let mut state = self.lock();
        state.log_offset += 1;
        let position = StreamPosition::new(MEMORY_LOG, state.log_offset);
        let Some(instance) = state.instances.last_mut() else {
            return false;
        };
        let Some(tx) = instance.tx.as_ref() else {
            return false;
        };
        instance.position = Some(position);
        if !instance.filter.includes(&event.schema, &event.table) {
            return false;
        }
        tx.send(StreamEvent::Change(event)).is_ok()
    }
}

impl ChangeStreamSource for MemorySource {
    fn open(&self, config: StreamConfig) -> (Box<dyn ChangeStream>, StreamEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        if state.auto_ready {
            let _ = tx.send(StreamEvent::Ready);
        }
        let index = state.instances.len();
        state.instances.push(Instance {
            filter: config.filter.clone(),
            position: config.resume_from.clone(),
            config,
            tx: Some(tx),
        });
        let stream = MemoryStream {
            state: self.state.clone(),
            index,
        };
        (Box::new(stream), rx)
    }
}

struct MemoryStream {
    state: Arc<Mutex<SourceState>>,
    index: usize,
}

impl MemoryStream {
    fn with_instance<R>(&self, f: impl FnOnce(&mut Instance) -> R) -> Option<R> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.instances.get_mut(self.index).map(f)
    }
}

impl ChangeStream for MemoryStream {
    fn set_filter(&mut self, filter: SchemaFilter) {
        self.with_instance(|i| i.filter = filter);
    }

    fn position(&self) -> Option<StreamPosition> {
        self.with_instance(|i| i.position.clone()).flatten()
    }

    fn stop(&mut self) {
        self.with_instance(|i| i.tx = None);
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        self.stop();
    }
}

type Handler = Box<dyn Fn(&str, &[Value]) -> anyhow::Result<Vec<Row>> + Send + Sync>;

/// [`QueryExecutor`] backed by a closure.
pub struct MemoryExecutor {
    handler: Handler,
    latency: Option<Duration>,
    calls: AtomicUsize,
    queries: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MemoryExecutor {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &[Value]) -> anyhow::Result<Vec<Row>> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            latency: None,
            calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Every execution takes `latency` to return its rows.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Executions started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryExecutor for MemoryExecutor {
    async fn execute(&self, query: &str, params: &[Value]) -> anyhow::Result<Vec<Row>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(query.to_string());
        // Rows are read when the query starts, like a database snapshot.
        let result = (self.handler)(query, params);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        result
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Keyed in-memory table that emits the change event for each mutation.
#[derive(Clone)]
pub struct MemoryTable {
    schema: String,
    name: String,
    key_column: String,
    rows: Arc<Mutex<BTreeMap<String, Row>>>,
}

impl MemoryTable {
    pub fn new(schema: &str, name: &str, key_column: &str) -> Self {
        Self {
            schema: schema.to_string(),
            name: name.to_string(),
            key_column: key_column.to_string(),
            rows: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Row>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn key_of(&self, row: &Row) -> Option<String> {
        row.get(&self.key_column).and_then(value_key)
    }

    pub fn insert(&self, row: Row) -> ChangeEvent {
        if let Some(key) = self.key_of(&row) {
            self.lock().insert(key, row.clone());
        }
        ChangeEvent::insert(&self.schema, &self.name, vec![row])
    }

    /// Modify the row keyed by `key`. `None` if there is no such row.
    pub fn update(&self, key: &Value, f: impl FnOnce(&mut Row)) -> Option<ChangeEvent> {
        let key = value_key(key)?;
        let mut rows = self.lock();
        let before = rows.remove(&key)?;
        let mut after = before.clone();
        f(&mut after);
        let new_key = self.key_of(&after).unwrap_or(key);
        rows.insert(new_key, after.clone());
        Some(ChangeEvent::update(
            &self.schema,
            &self.name,
            vec![RowPair { before, after }],
        ))
    }

    pub fn delete(&self, key: &Value) -> Option<ChangeEvent> {
        let key = value_key(key)?;
        let row = self.lock().remove(&key)?;
        Some(ChangeEvent::delete(&self.schema, &self.name, vec![row]))
    }

    /// Rows in key order.
    pub fn rows(&self) -> Vec<Row> {
        self.lock().values().cloned().collect()
    }

    /// Contents keyed like a mirror of this table.
    pub fn snapshot(&self) -> Snapshot {
        self.lock().clone()
    }
}
