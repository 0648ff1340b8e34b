//! Public entry point.

use std::sync::Arc;
use std::time::Duration;

use sync_core::{ChangeStreamSource, KeySelector, QueryExecutor, StreamPosition, Trigger, Value};
use tokio::sync::mpsc;

use crate::config::LiveConfig;
use crate::connection::StreamState;
use crate::engine::Engine;
use crate::error::{ConnectionError, SelectError};
use crate::mirror::TableMirror;
use crate::subscription::Subscription;

/// Connection-level notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A change stream instance is connected and delivering. Emitted once
    /// per instance, so again after every successful reconnect.
    Ready,
    /// Fatal. Nothing is retried after this.
    Error(ConnectionError),
}

pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

/// A live connection: one change stream feeding any number of live selects
/// and table mirrors.
///
/// Clones share the connection. Subscriptions do not keep it alive: once
/// every `LiveSync` handle is dropped the stream stops and pending
/// subscriptions see the end of their event channel.
#[derive(Clone)]
pub struct LiveSync {
    engine: Arc<Engine>,
}

impl LiveSync {
    /// Open the change stream and start the engine.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: LiveConfig,
        source: Arc<dyn ChangeStreamSource>,
        executor: Arc<dyn QueryExecutor>,
    ) -> (LiveSync, ConnectionEvents) {
        let (engine, events) = Engine::start(config, source, executor);
        (LiveSync { engine }, events)
    }

    /// Register a live select.
    ///
    /// Identical `(query, params, keys)` combinations share one cache entry
    /// and therefore one execution per refresh. `min_interval` falls back to
    /// the connection default and only applies when this call creates the
    /// entry.
    pub fn select(
        &self,
        query: impl Into<String>,
        params: Vec<Value>,
        keys: KeySelector,
        triggers: Vec<Trigger>,
        min_interval: Option<Duration>,
    ) -> Result<Subscription, SelectError> {
        let (id, events) =
            self.engine
                .lock()
                .select(query.into(), params, keys, triggers, min_interval)?;
        Ok(Subscription::new(id, Arc::downgrade(&self.engine), events))
    }

    /// Mirror a whole table keyed by `key_column`.
    ///
    /// `schema` falls back to the connection default.
    pub fn create_table_mirror(
        &self,
        schema: Option<&str>,
        table: &str,
        key_column: &str,
    ) -> Result<TableMirror, SelectError> {
        self.engine
            .lock()
            .create_table_mirror(schema, table, key_column)
    }

    /// Stop delivering change events without disconnecting.
    pub fn pause(&self) {
        self.engine.lock().pause();
    }

    /// Undo [`pause`](Self::pause). Every live select is refreshed and every
    /// table mirror rescanned, since changes made while paused were not
    /// observed.
    pub fn resume(&self) {
        self.engine.lock().resume();
    }

    /// Stop the change stream and close the executor. Subscriptions stop
    /// receiving events, mirrors keep their last contents but no longer
    /// follow changes, and further `select` calls fail.
    pub fn end(&self) {
        self.engine.lock().end();
    }

    /// Last known stream position, for checkpointing.
    ///
    /// Falls back to the position of the previous instance while
    /// reconnecting, after a fatal error and after [`end`](Self::end).
    pub fn position(&self) -> Option<StreamPosition> {
        self.engine.lock().position()
    }

    pub fn state(&self) -> StreamState {
        self.engine.lock().state()
    }

    pub fn is_paused(&self) -> bool {
        self.engine.lock().is_paused()
    }

    /// Number of distinct live selects currently cached.
    pub fn query_count(&self) -> usize {
        self.engine.lock().entry_count()
    }

    /// Number of table mirrors kept up to date.
    pub fn mirror_count(&self) -> usize {
        self.engine.lock().mirror_count()
    }
}

impl std::fmt::Debug for LiveSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.engine.lock();
        f.debug_struct("LiveSync")
            .field("state", &inner.state())
            .field("queries", &inner.entry_count())
            .finish()
    }
}
