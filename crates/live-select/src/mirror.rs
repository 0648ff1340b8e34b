//! Whole-table mirrors maintained from change events.
//!
//! A mirror is loaded with one full scan and then patched row by row from
//! the change stream. Events that arrive while a scan is still running are
//! buffered and replayed on top of the scan result. The connection rescans
//! every mirror after a pause, since changes made meanwhile were not seen.

use std::sync::{Arc, Mutex, MutexGuard};

use sync_core::values::value_key;
use sync_core::{ChangeEvent, Row, RowChanges, Snapshot};

#[derive(Debug)]
enum Status {
    Loading { buffered: Vec<ChangeEvent> },
    Ready,
    Failed(String),
}

#[derive(Debug)]
struct State {
    status: Status,
    data: Snapshot,
    /// Number of the scan whose result is awaited.
    load: u64,
    /// Some scan has succeeded.
    loaded: bool,
}

/// Handle to an in-memory copy of one table, keyed by a single column.
///
/// Clones share the same data.
#[derive(Debug, Clone)]
pub struct TableMirror {
    schema: Arc<str>,
    table: Arc<str>,
    key_column: Arc<str>,
    state: Arc<Mutex<State>>,
}

impl TableMirror {
    pub(crate) fn new(schema: &str, table: &str, key_column: &str) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            key_column: key_column.into(),
            state: Arc::new(Mutex::new(State {
                status: Status::Loading {
                    buffered: Vec::new(),
                },
                data: Snapshot::new(),
                load: 0,
                loaded: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    /// `true` once the initial scan has been applied. Stays `true` while a
    /// rescan runs; the previous contents remain readable meanwhile.
    pub fn is_ready(&self) -> bool {
        let state = self.lock();
        state.loaded && !matches!(state.status, Status::Failed(_))
    }

    /// Why the initial scan failed, if it did.
    pub fn load_error(&self) -> Option<String> {
        match &self.lock().status {
            Status::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<Row> {
        self.lock().data.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().data.is_empty()
    }

    /// Copy of the current table contents.
    pub fn snapshot(&self) -> Snapshot {
        self.lock().data.clone()
    }

    /// Run `f` against the current contents without copying them.
    pub fn with_data<R>(&self, f: impl FnOnce(&Snapshot) -> R) -> R {
        f(&self.lock().data)
    }

    /// Apply a change event, or buffer it while the scan is running.
    pub(crate) fn apply(&self, event: &ChangeEvent) {
        if !event.is_for(&self.schema, &self.table) {
            return;
        }
        let mut guard = self.lock();
        let state = &mut *guard;
        match &mut state.status {
            Status::Loading { buffered } => buffered.push(event.clone()),
            Status::Ready => apply_event(&mut state.data, &self.key_column, event),
            Status::Failed(_) => {}
        }
    }

    /// Start a scan; events are buffered until its result arrives. Returns
    /// the number to hand to [`finish_load`](Self::finish_load).
    pub(crate) fn begin_load(&self) -> u64 {
        let mut state = self.lock();
        state.load += 1;
        state.status = Status::Loading {
            buffered: Vec::new(),
        };
        state.load
    }

    /// Install the result of scan `load` and replay what arrived meanwhile.
    /// Results of superseded scans are dropped.
    pub(crate) fn finish_load(&self, load: u64, result: anyhow::Result<Vec<Row>>) {
        let mut state = self.lock();
        if state.load != load {
            return;
        }
        let Status::Loading { buffered } =
            std::mem::replace(&mut state.status, Status::Ready)
        else {
            return;
        };

        match result {
            Ok(rows) => {
                let mut data = Snapshot::new();
                for row in rows {
                    insert_row(&mut data, &self.key_column, row);
                }
                for event in &buffered {
                    apply_event(&mut data, &self.key_column, event);
                }
                tracing::info!(
                    "Mirror of {}.{} loaded with {} rows ({} buffered events replayed)",
                    self.schema,
                    self.table,
                    data.len(),
                    buffered.len()
                );
                state.data = data;
                state.loaded = true;
            }
            Err(err) => {
                tracing::error!(
                    "Initial scan of {}.{} failed: {err:#}",
                    self.schema,
                    self.table
                );
                state.status = Status::Failed(format!("{err:#}"));
            }
        }
    }
}

fn row_key(row: &Row, key_column: &str) -> Option<String> {
    row.get(key_column).and_then(value_key)
}

fn insert_row(data: &mut Snapshot, key_column: &str, row: Row) {
    match row_key(&row, key_column) {
        Some(key) => {
            data.insert(key, row);
        }
        None => tracing::warn!("Skipping mirrored row without '{key_column}' value"),
    }
}

pub(crate) fn apply_event(data: &mut Snapshot, key_column: &str, event: &ChangeEvent) {
    match &event.rows {
        RowChanges::Insert(rows) => {
            for row in rows {
                insert_row(data, key_column, row.clone());
            }
        }
        RowChanges::Update(pairs) => {
            for pair in pairs {
                let before = row_key(&pair.before, key_column);
                let after = row_key(&pair.after, key_column);
                if let Some(before) = before.filter(|b| after.as_ref() != Some(b)) {
                    data.remove(&before);
                }
                insert_row(data, key_column, pair.after.clone());
            }
        }
        RowChanges::Delete(rows) => {
            for row in rows {
                if let Some(key) = row_key(row, key_column) {
                    data.remove(&key);
                }
            }
        }
    }
}
