//! Change stream tailing the audit table.
//!
//! Each opened instance owns one polling task and one connection. The task
//! resolves its starting sequence id, reports readiness, then repeatedly
//! reads the next batch of audit rows in `sequence_id` order and forwards
//! the ones its filter includes. The first failure is reported as
//! [`StreamEvent::Error`] and ends the instance; reconnecting is the
//! engine's job.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use mysql_async::{prelude::*, Pool};
use sync_core::{
    ChangeEvent, ChangeKind, ChangeStream, ChangeStreamSource, Row, RowPair, SchemaFilter,
    StreamConfig, StreamEvent, StreamEvents, StreamPosition,
};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::change_tracking::AUDIT_TABLE;
use crate::checkpoint::{audit_table_exists, get_current_position, resume_offset};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// [`ChangeStreamSource`] over the trigger-maintained audit table.
#[derive(Clone)]
pub struct MySQLTriggerSource {
    pool: Pool,
    poll_interval: Duration,
    batch_size: usize,
}

impl MySQLTriggerSource {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Pause between polls that found no new rows.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Maximum audit rows read per poll.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

struct Shared {
    filter: SchemaFilter,
    position: Option<StreamPosition>,
}

type SharedState = Arc<Mutex<Shared>>;

fn lock(shared: &SharedState) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

impl ChangeStreamSource for MySQLTriggerSource {
    fn open(&self, config: StreamConfig) -> (Box<dyn ChangeStream>, StreamEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(Shared {
            filter: config.filter.clone(),
            position: None,
        }));
        let poller = Poller {
            pool: self.pool.clone(),
            shared: shared.clone(),
            tx,
            poll_interval: self.poll_interval,
            batch_size: self.batch_size,
        };
        let task = tokio::spawn(poller.run(config));
        let stream = MySQLTriggerStream {
            shared,
            task: task.abort_handle(),
        };
        (Box::new(stream), rx)
    }
}

/// Control handle of one polling task.
pub struct MySQLTriggerStream {
    shared: SharedState,
    task: AbortHandle,
}

impl ChangeStream for MySQLTriggerStream {
    fn set_filter(&mut self, filter: SchemaFilter) {
        lock(&self.shared).filter = filter;
    }

    fn position(&self) -> Option<StreamPosition> {
        lock(&self.shared).position.clone()
    }

    fn stop(&mut self) {
        self.task.abort();
    }
}

impl Drop for MySQLTriggerStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Poller {
    pool: Pool,
    shared: SharedState,
    tx: mpsc::UnboundedSender<StreamEvent>,
    poll_interval: Duration,
    batch_size: usize,
}

impl Poller {
    async fn run(self, config: StreamConfig) {
        if let Err(err) = self.poll(config).await {
            let _ = self.tx.send(StreamEvent::Error(err));
        }
    }

    async fn poll(&self, config: StreamConfig) -> Result<()> {
        debug!("Opening audit stream for server id {}", config.server_id);
        let mut conn = self
            .pool
            .get_conn()
            .await
            .context("Failed to connect to MySQL")?;
        if !audit_table_exists(&mut conn).await? {
            return Err(anyhow!(
                "Audit table {AUDIT_TABLE} not found; run change tracking setup first"
            ));
        }

        let mut last = match &config.resume_from {
            Some(position) => resume_offset(position)?,
            None if config.start_at_end => get_current_position(&mut conn).await?.offset,
            None => 0,
        };
        lock(&self.shared).position = Some(StreamPosition::new(AUDIT_TABLE, last));
        info!("Audit stream reading after sequence id {last}");
        if self.tx.send(StreamEvent::Ready).is_err() {
            return Ok(());
        }

        let query = format!(
            "SELECT sequence_id, schema_name, table_name, operation, old_data, new_data
             FROM {AUDIT_TABLE}
             WHERE sequence_id > ?
             ORDER BY sequence_id
             LIMIT ?"
        );
        loop {
            let rows: Vec<mysql_async::Row> = conn
                .exec(query.as_str(), (last, self.batch_size as u64))
                .await?;
            let fetched = rows.len();

            for row in rows {
                let record = AuditRecord::from_row(&row)?;
                last = record.sequence_id;
                let included = lock(&self.shared)
                    .filter
                    .includes(&record.schema, &record.table);
                if included && self.tx.send(StreamEvent::Change(record.into_event()?)).is_err() {
                    return Ok(());
                }
                lock(&self.shared).position = Some(StreamPosition::new(AUDIT_TABLE, last));
            }

            if fetched < self.batch_size {
                if self.tx.is_closed() {
                    return Ok(());
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }
}

/// One decoded audit row.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AuditRecord {
    pub sequence_id: u64,
    pub schema: String,
    pub table: String,
    pub operation: ChangeKind,
    pub old_data: Option<Row>,
    pub new_data: Option<Row>,
}

impl AuditRecord {
    fn from_row(row: &mysql_async::Row) -> Result<Self> {
        let sequence_id: u64 = column(row, 0, "sequence_id")?;
        let schema: String = column(row, 1, "schema_name")?;
        let table: String = column(row, 2, "table_name")?;
        let operation: String = column(row, 3, "operation")?;
        Ok(Self {
            sequence_id,
            operation: parse_operation(&operation)?,
            old_data: row_image(row.as_ref(4))
                .with_context(|| format!("Bad old_data in audit row {sequence_id}"))?,
            new_data: row_image(row.as_ref(5))
                .with_context(|| format!("Bad new_data in audit row {sequence_id}"))?,
            schema,
            table,
        })
    }

    pub fn into_event(self) -> Result<ChangeEvent> {
        let origin = format!(
            "Audit row {} ({} on {}.{})",
            self.sequence_id, self.operation, self.schema, self.table
        );
        let missing = |which: &str| anyhow!("{origin} has no {which} image");
        Ok(match self.operation {
            ChangeKind::Insert => {
                let after = self.new_data.ok_or_else(|| missing("new"))?;
                ChangeEvent::insert(self.schema, self.table, vec![after])
            }
            ChangeKind::Update => {
                let before = self.old_data.ok_or_else(|| missing("old"))?;
                let after = self.new_data.ok_or_else(|| missing("new"))?;
                ChangeEvent::update(self.schema, self.table, vec![RowPair { before, after }])
            }
            ChangeKind::Delete => {
                let before = self.old_data.ok_or_else(|| missing("old"))?;
                ChangeEvent::delete(self.schema, self.table, vec![before])
            }
        })
    }
}

fn column<T: FromValue>(row: &mysql_async::Row, index: usize, name: &str) -> Result<T> {
    match row.get_opt::<T, _>(index) {
        Some(Ok(value)) => Ok(value),
        Some(Err(err)) => Err(anyhow!("Invalid {name} in audit row: {err}")),
        None => Err(anyhow!("Missing {name} in audit row")),
    }
}

pub(crate) fn parse_operation(operation: &str) -> Result<ChangeKind> {
    match operation {
        "INSERT" => Ok(ChangeKind::Insert),
        "UPDATE" => Ok(ChangeKind::Update),
        "DELETE" => Ok(ChangeKind::Delete),
        other => Err(anyhow!("Unknown operation type: {other}")),
    }
}

/// Decode a JSON object row image; SQL NULL means no image.
pub(crate) fn row_image(raw: Option<&mysql_async::Value>) -> Result<Option<Row>> {
    match raw {
        None | Some(mysql_async::Value::NULL) => Ok(None),
        Some(mysql_async::Value::Bytes(bytes)) => match serde_json::from_slice(bytes)? {
            serde_json::Value::Object(map) => Ok(Some(map.into_iter().collect())),
            other => Err(anyhow!("Expected a JSON object, got {other}")),
        },
        Some(other) => Err(anyhow!("Expected JSON text, got {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sync_core::values::row;

    fn record(operation: ChangeKind, old: Option<Row>, new: Option<Row>) -> AuditRecord {
        AuditRecord {
            sequence_id: 7,
            schema: "app".into(),
            table: "players".into(),
            operation,
            old_data: old,
            new_data: new,
        }
    }

    #[test]
    fn test_parse_operation() {
        assert_eq!(parse_operation("INSERT").unwrap(), ChangeKind::Insert);
        assert_eq!(parse_operation("UPDATE").unwrap(), ChangeKind::Update);
        assert_eq!(parse_operation("DELETE").unwrap(), ChangeKind::Delete);
        assert!(parse_operation("TRUNCATE").is_err());
    }

    #[test]
    fn test_row_image_decoding() {
        let bytes = mysql_async::Value::Bytes(br#"{"id": 1, "name": "ann"}"#.to_vec());
        assert_eq!(
            row_image(Some(&bytes)).unwrap(),
            Some(row([("id", json!(1)), ("name", json!("ann"))]))
        );
        assert_eq!(row_image(Some(&mysql_async::Value::NULL)).unwrap(), None);
        assert_eq!(row_image(None).unwrap(), None);

        let array = mysql_async::Value::Bytes(b"[1, 2]".to_vec());
        assert!(row_image(Some(&array)).is_err());
        assert!(row_image(Some(&mysql_async::Value::Int(3))).is_err());
    }

    #[test]
    fn test_records_become_change_events() {
        let before = row([("id", json!(1)), ("score", json!(1))]);
        let after = row([("id", json!(1)), ("score", json!(2))]);

        let insert = record(ChangeKind::Insert, None, Some(after.clone()))
            .into_event()
            .unwrap();
        assert_eq!(insert, ChangeEvent::insert("app", "players", vec![after.clone()]));

        let update = record(ChangeKind::Update, Some(before.clone()), Some(after.clone()))
            .into_event()
            .unwrap();
        assert_eq!(
            update,
            ChangeEvent::update(
                "app",
                "players",
                vec![RowPair {
                    before: before.clone(),
                    after: after.clone()
                }]
            )
        );

        let delete = record(ChangeKind::Delete, Some(before.clone()), None)
            .into_event()
            .unwrap();
        assert_eq!(delete, ChangeEvent::delete("app", "players", vec![before]));
    }

    #[test]
    fn test_missing_image_is_an_error() {
        let err = record(ChangeKind::Update, None, Some(row([("id", json!(1))])))
            .into_event()
            .unwrap_err();
        assert!(err.to_string().contains("no old image"));
        assert!(record(ChangeKind::Insert, None, None).into_event().is_err());
    }
}
