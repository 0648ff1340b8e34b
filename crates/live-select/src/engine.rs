//! Shared engine state.
//!
//! All bookkeeping lives in [`Inner`] behind one mutex and is only ever
//! touched synchronously. Anything that waits (executions, throttle timers,
//! reconnect backoff, the init deadline, the stream pump) runs as a spawned
//! task holding a `Weak` reference and re-enters through a small `on_*`
//! callback. Callbacks identify their target by entry id or stream
//! generation and do nothing when that target is gone.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use sync_core::values::is_scalar;
use sync_core::{
    ChangeEvent, ChangeStream, ChangeStreamSource, Diff, KeySelector, QueryExecutor, Row,
    SchemaFilter, StreamConfig, StreamEvent, StreamPosition, Trigger, Value,
};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::LiveConfig;
use crate::connection::{StreamAction, StreamInput, StreamManager, StreamState};
use crate::dispatcher;
use crate::error::SelectError;
use crate::live::ConnectionEvent;
use crate::mirror::TableMirror;
use crate::query_cache::{cache_key, EntryId, Plan, QueryCache, Subscriber};
use crate::subscription::{SelectEvent, SubscriptionId};

pub(crate) struct Engine {
    inner: Mutex<Inner>,
}

impl Engine {
    pub(crate) fn start(
        config: LiveConfig,
        source: Arc<dyn ChangeStreamSource>,
        executor: Arc<dyn QueryExecutor>,
    ) -> (Arc<Engine>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = StreamManager::new(config.reconnect.clone(), config.resume_from.clone());
        let last_position = config.resume_from.clone();
        let engine = Arc::new_cyclic(|this| Engine {
            inner: Mutex::new(Inner {
                this: this.clone(),
                manager,
                config,
                source,
                executor,
                events,
                stream: None,
                last_position,
                init_deadline: None,
                reconnect_timer: None,
                filter: SchemaFilter::new(),
                paused: false,
                ended: false,
                entries: BTreeMap::new(),
                by_key: HashMap::new(),
                subscriptions: HashMap::new(),
                mirrors: Vec::new(),
                next_id: 1,
            }),
        });
        engine.lock().drive(StreamInput::Start);
        (engine, rx)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct ActiveStream {
    generation: u64,
    handle: Box<dyn ChangeStream>,
    pump: AbortHandle,
}

impl ActiveStream {
    fn shutdown(mut self) {
        self.handle.stop();
        self.pump.abort();
    }
}

pub(crate) struct Inner {
    this: Weak<Engine>,
    config: LiveConfig,
    source: Arc<dyn ChangeStreamSource>,
    executor: Arc<dyn QueryExecutor>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    manager: StreamManager,
    stream: Option<ActiveStream>,
    /// Position of the most recent instance that went away.
    last_position: Option<StreamPosition>,
    init_deadline: Option<AbortHandle>,
    reconnect_timer: Option<AbortHandle>,
    /// Every table any trigger or mirror ever asked for.
    filter: SchemaFilter,
    paused: bool,
    ended: bool,
    entries: BTreeMap<EntryId, QueryCache>,
    by_key: HashMap<String, EntryId>,
    subscriptions: HashMap<SubscriptionId, EntryId>,
    mirrors: Vec<TableMirror>,
    next_id: u64,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Spawn `f` against the engine once `deadline` passes, if it still exists.
    fn spawn_at<F>(&self, deadline: Instant, f: F) -> AbortHandle
    where
        F: FnOnce(&mut Inner) + Send + 'static,
    {
        let this = self.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(engine) = this.upgrade() {
                f(&mut *engine.lock());
            }
        })
        .abort_handle()
    }

    fn spawn_after<F>(&self, delay: Duration, f: F) -> AbortHandle
    where
        F: FnOnce(&mut Inner) + Send + 'static,
    {
        self.spawn_at(Instant::now() + delay, f)
    }

    // Stream lifecycle

    fn drive(&mut self, input: StreamInput) {
        for action in self.manager.handle(input) {
            self.perform(action);
        }
    }

    fn perform(&mut self, action: StreamAction) {
        match action {
            StreamAction::Open {
                generation,
                resume_from,
            } => self.open_stream(generation, resume_from),
            StreamAction::CancelInitDeadline => {
                if let Some(deadline) = self.init_deadline.take() {
                    deadline.abort();
                }
            }
            StreamAction::CancelReconnect => {
                if let Some(timer) = self.reconnect_timer.take() {
                    timer.abort();
                }
            }
            StreamAction::TearDown { generation } => {
                if self
                    .stream
                    .as_ref()
                    .is_some_and(|s| s.generation == generation)
                {
                    if let Some(stream) = self.stream.take() {
                        self.retire(stream);
                    }
                }
            }
            StreamAction::ScheduleReconnect { attempt, delay } => {
                info!(
                    "Reconnecting change stream (attempt {attempt} of {}) in {delay:?}",
                    self.manager.policy().max_attempts
                );
                self.reconnect_timer = Some(self.spawn_after(delay, |inner| {
                    inner.reconnect_timer = None;
                    inner.drive(StreamInput::ReconnectDue);
                }));
            }
            StreamAction::EmitReady { resumed } => {
                if resumed {
                    info!("Change stream resumed");
                } else {
                    info!("Change stream ready");
                }
                let _ = self.events.send(ConnectionEvent::Ready);
            }
            StreamAction::EmitFatal(err) => {
                error!("Live sync connection failed: {err}");
                let _ = self.events.send(ConnectionEvent::Error(err));
            }
        }
    }

    fn open_stream(&mut self, generation: u64, resume_from: Option<StreamPosition>) {
        match &resume_from {
            Some(position) => info!("Opening change stream at {position}"),
            None => info!("Opening change stream at end of log"),
        }
        let config = StreamConfig {
            server_id: self.config.server_id,
            filter: self.live_filter(),
            start_at_end: resume_from.is_none(),
            resume_from,
        };
        let (handle, mut events) = self.source.open(config);

        let this = self.this.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(engine) = this.upgrade() else {
                    return;
                };
                engine.lock().on_stream_event(generation, event);
            }
            if let Some(engine) = this.upgrade() {
                engine.lock().on_stream_closed(generation);
            }
        })
        .abort_handle();

        if let Some(previous) = self.stream.replace(ActiveStream {
            generation,
            handle,
            pump,
        }) {
            self.retire(previous);
        }

        let timeout = self.manager.policy().init_timeout;
        self.init_deadline = Some(self.spawn_after(timeout, move |inner| {
            inner.on_init_timeout(generation);
        }));
    }

    fn on_init_timeout(&mut self, generation: u64) {
        if self.manager.is_current(generation) {
            self.init_deadline = None;
            self.drive(StreamInput::InitTimeout { generation });
        }
    }

    fn on_stream_event(&mut self, generation: u64, event: StreamEvent) {
        match event {
            StreamEvent::Ready => self.drive(StreamInput::Ready { generation }),
            StreamEvent::Error(err) => {
                if !self.manager.is_current(generation) {
                    return;
                }
                warn!("Change stream error: {err:#}");
                let position = self.position_of(generation);
                self.drive(StreamInput::Error {
                    generation,
                    position,
                });
            }
            StreamEvent::Change(event) => {
                if self.paused || !self.manager.is_current(generation) {
                    return;
                }
                self.dispatch(&event);
            }
        }
    }

    fn on_stream_closed(&mut self, generation: u64) {
        if !self.manager.is_current(generation) {
            return;
        }
        warn!("Change stream closed without reporting an error");
        let position = self.position_of(generation);
        self.drive(StreamInput::Error {
            generation,
            position,
        });
    }

    fn retire(&mut self, stream: ActiveStream) {
        if let Some(position) = stream.handle.position() {
            self.last_position = Some(position);
        }
        stream.shutdown();
    }

    fn position_of(&self, generation: u64) -> Option<StreamPosition> {
        self.stream
            .as_ref()
            .filter(|s| s.generation == generation)
            .and_then(|s| s.handle.position())
    }

    /// Filter the live stream should be running with.
    fn live_filter(&self) -> SchemaFilter {
        if self.paused {
            SchemaFilter::new()
        } else {
            self.filter.clone()
        }
    }

    fn push_filter(&mut self) {
        let filter = self.live_filter();
        if let Some(stream) = self.stream.as_mut() {
            debug!("Updating change stream filter: {:?}", filter);
            stream.handle.set_filter(filter);
        }
    }

    fn watch(&mut self, schema: &str, table: &str) {
        if self.filter.add(schema, table) {
            self.push_filter();
        }
    }

    // Query caches

    fn dispatch(&mut self, event: &ChangeEvent) {
        let invalidated = dispatcher::dispatch(
            event,
            &self.mirrors,
            &self.entries,
            self.config.check_condition_when_queued,
            self.config.default_schema.as_deref(),
        );
        if !invalidated.is_empty() {
            debug!(
                "{} on {}.{} ({} rows) invalidated {} live selects",
                event.kind(),
                event.schema,
                event.table,
                event.row_count(),
                invalidated.len()
            );
        }
        for id in invalidated {
            self.schedule(id);
        }
    }

    fn schedule(&mut self, id: EntryId) {
        if self.ended {
            return;
        }
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        match entry.plan(Instant::now()) {
            Plan::Execute => self.execute(id),
            Plan::Queued => trace!("Refresh of {id:?} already queued"),
            Plan::Wait(due) => {
                let timer = self.spawn_at(due, move |inner| inner.on_refresh_due(id));
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.timer = Some(timer);
                }
            }
        }
    }

    fn execute(&mut self, id: EntryId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if !entry.begin_execution(Instant::now()) {
            trace!("Live select {id:?} still running, refresh deferred");
            return;
        }
        debug!("Executing live select: {}", entry.query);

        let query = entry.query.clone();
        let params = entry.params.clone();
        let executor = self.executor.clone();
        let this = self.this.clone();
        tokio::spawn(async move {
            let result = executor.execute(&query, &params).await;
            if let Some(engine) = this.upgrade() {
                engine.lock().on_execution_complete(id, result);
            }
        });
    }

    fn on_refresh_due(&mut self, id: EntryId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.timer = None;
            self.execute(id);
        }
    }

    fn on_execution_complete(&mut self, id: EntryId, result: anyhow::Result<Vec<Row>>) {
        if self.ended {
            return;
        }
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.finish_execution(result) {
            self.schedule(id);
        }
    }

    fn send_catch_up(&mut self, entry: EntryId, subscription: SubscriptionId, seen_seq: u64) {
        let Some(entry) = self.entries.get(&entry) else {
            return;
        };
        if entry.update_seq != seen_seq {
            return;
        }
        if let Some(subscriber) = entry.subscriber(subscription) {
            let _ = subscriber.tx.send(SelectEvent::Update {
                diff: Arc::new(Diff::initial((*entry.data).clone())),
                data: entry.data.clone(),
            });
        }
    }

    // Public operations

    pub(crate) fn select(
        &mut self,
        query: String,
        params: Vec<Value>,
        keys: KeySelector,
        triggers: Vec<Trigger>,
        min_interval: Option<Duration>,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<SelectEvent>), SelectError> {
        if self.ended {
            return Err(SelectError::Closed);
        }
        if query.trim().is_empty() {
            return Err(SelectError::EmptyQuery);
        }
        if let Some(index) = params.iter().position(|p| !is_scalar(p)) {
            return Err(SelectError::InvalidParam { index });
        }
        if keys.key_columns().is_some_and(<[String]>::is_empty) {
            return Err(SelectError::EmptyKeyColumns);
        }
        if triggers.is_empty() {
            return Err(SelectError::MissingTriggers);
        }

        let default_schema = self.config.default_schema.clone();
        let mut watched = Vec::with_capacity(triggers.len());
        for trigger in &triggers {
            let schema = trigger
                .resolve_schema(default_schema.as_deref())
                .ok_or_else(|| SelectError::NoSchema {
                    table: trigger.table_name().to_string(),
                })?;
            watched.push((schema.to_string(), trigger.table_name().to_string()));
        }
        for (schema, table) in &watched {
            self.watch(schema, table);
        }

        let id = SubscriptionId(self.next_id());
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = Subscriber { id, triggers, tx };
        let key = cache_key(&query, &params, &keys);

        if let Some(entry) = self
            .by_key
            .get(&key)
            .and_then(|entry_id| self.entries.get_mut(entry_id))
        {
            let entry_id = entry.id;
            entry.subscribers.push(subscriber);
            self.subscriptions.insert(id, entry_id);
            debug!(
                "{id} joined live select {entry_id:?} ({} subscribers)",
                entry.subscribers.len()
            );

            if entry.initialized {
                let seen_seq = entry.update_seq;
                let this = self.this.clone();
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    if let Some(engine) = this.upgrade() {
                        engine.lock().send_catch_up(entry_id, id, seen_seq);
                    }
                });
            } else {
                self.schedule(entry_id);
            }
        } else {
            let entry_id = EntryId(self.next_id());
            let mut entry = QueryCache::new(
                entry_id,
                key.clone(),
                query,
                params,
                keys,
                min_interval.or(self.config.min_interval),
            );
            entry.subscribers.push(subscriber);
            debug!("{id} created live select {entry_id:?}");
            self.entries.insert(entry_id, entry);
            self.by_key.insert(key, entry_id);
            self.subscriptions.insert(id, entry_id);
            self.schedule(entry_id);
        }

        Ok((id, rx))
    }

    pub(crate) fn create_table_mirror(
        &mut self,
        schema: Option<&str>,
        table: &str,
        key_column: &str,
    ) -> Result<TableMirror, SelectError> {
        if self.ended {
            return Err(SelectError::Closed);
        }
        let schema = schema
            .or(self.config.default_schema.as_deref())
            .ok_or_else(|| SelectError::NoSchema {
                table: table.to_string(),
            })?
            .to_string();
        for name in [schema.as_str(), table, key_column] {
            check_identifier(name)?;
        }

        let mirror = TableMirror::new(&schema, table, key_column);
        self.watch(&schema, table);
        self.mirrors.push(mirror.clone());
        info!("Mirroring {schema}.{table} keyed by {key_column}");
        self.load_mirror(&mirror);

        Ok(mirror)
    }

    /// Scan the mirrored table; events are buffered until the scan lands.
    fn load_mirror(&self, mirror: &TableMirror) {
        let load = mirror.begin_load();
        let query = format!("SELECT * FROM {}.{}", mirror.schema(), mirror.table());
        let executor = self.executor.clone();
        let loading = mirror.clone();
        tokio::spawn(async move {
            let result = executor.execute(&query, &[]).await;
            loading.finish_load(load, result);
        });
    }

    pub(crate) fn remove_subscription(&mut self, id: SubscriptionId) -> bool {
        let Some(entry_id) = self.subscriptions.remove(&id) else {
            return false;
        };
        let Some(entry) = self.entries.get_mut(&entry_id) else {
            return true;
        };
        entry.subscribers.retain(|s| s.id != id);
        if entry.subscribers.is_empty() {
            if let Some(mut entry) = self.entries.remove(&entry_id) {
                entry.cancel_timer();
                self.by_key.remove(&entry.cache_key);
                debug!("Dropped live select {entry_id:?}: {}", entry.query);
            }
        }
        true
    }

    pub(crate) fn has_subscription(&self, id: SubscriptionId) -> bool {
        self.subscriptions.contains_key(&id)
    }

    pub(crate) fn invalidate_subscription(&mut self, id: SubscriptionId) {
        if let Some(entry_id) = self.subscriptions.get(&id).copied() {
            self.schedule(entry_id);
        }
    }

    pub(crate) fn pause(&mut self) {
        if self.ended || self.paused {
            return;
        }
        self.paused = true;
        self.push_filter();
        info!("Live sync paused");
    }

    pub(crate) fn resume(&mut self) {
        if self.ended || !self.paused {
            return;
        }
        self.paused = false;
        self.push_filter();
        info!(
            "Live sync resumed, refreshing {} live selects and {} mirrors",
            self.entries.len(),
            self.mirrors.len()
        );
        let ids: Vec<EntryId> = self.entries.keys().copied().collect();
        for id in ids {
            self.schedule(id);
        }
        for mirror in &self.mirrors {
            self.load_mirror(mirror);
        }
    }

    pub(crate) fn end(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.drive(StreamInput::Close);
        for (_, mut entry) in std::mem::take(&mut self.entries) {
            entry.cancel_timer();
        }
        self.by_key.clear();
        self.subscriptions.clear();
        self.mirrors.clear();

        let executor = self.executor.clone();
        tokio::spawn(async move {
            if let Err(e) = executor.close().await {
                warn!("Failed to close query executor: {e:#}");
            }
        });
        info!("Live sync ended");
    }

    pub(crate) fn position(&self) -> Option<StreamPosition> {
        self.stream
            .as_ref()
            .and_then(|s| s.handle.position())
            .or_else(|| self.last_position.clone())
    }

    pub(crate) fn state(&self) -> StreamState {
        self.manager.state().clone()
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn mirror_count(&self) -> usize {
        self.mirrors.len()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.shutdown();
        }
        for timer in [self.init_deadline.take(), self.reconnect_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
        for entry in self.entries.values_mut() {
            entry.cancel_timer();
        }
    }
}

/// Schema, table and column names are interpolated into SQL.
fn check_identifier(name: &str) -> Result<(), SelectError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if valid {
        Ok(())
    } else {
        Err(SelectError::InvalidIdentifier(name.to_string()))
    }
}
