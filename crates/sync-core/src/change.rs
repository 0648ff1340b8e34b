//! Decoded row-level change events.

use serde::{Deserialize, Serialize};

use crate::values::Row;

/// Kind of row operation carried by a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Before and after images of one updated row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowPair {
    pub before: Row,
    pub after: Row,
}

/// Row images of a change, shaped by the kind of change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "rows", rename_all = "snake_case")]
pub enum RowChanges {
    Insert(Vec<Row>),
    Update(Vec<RowPair>),
    Delete(Vec<Row>),
}

/// One committed change to one table, possibly touching several rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub schema: String,
    pub table: String,
    pub rows: RowChanges,
}

impl ChangeEvent {
    pub fn insert(schema: impl Into<String>, table: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            rows: RowChanges::Insert(rows),
        }
    }

    pub fn update(
        schema: impl Into<String>,
        table: impl Into<String>,
        rows: Vec<RowPair>,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            rows: RowChanges::Update(rows),
        }
    }

    pub fn delete(schema: impl Into<String>, table: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            rows: RowChanges::Delete(rows),
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self.rows {
            RowChanges::Insert(_) => ChangeKind::Insert,
            RowChanges::Update(_) => ChangeKind::Update,
            RowChanges::Delete(_) => ChangeKind::Delete,
        }
    }

    pub fn row_count(&self) -> usize {
        match &self.rows {
            RowChanges::Insert(rows) | RowChanges::Delete(rows) => rows.len(),
            RowChanges::Update(pairs) => pairs.len(),
        }
    }

    /// `true` if this event concerns `schema.table`.
    pub fn is_for(&self, schema: &str, table: &str) -> bool {
        self.schema == schema && self.table == table
    }

    /// Per-row views handed to trigger conditions.
    pub fn row_events(&self) -> Box<dyn Iterator<Item = RowEvent<'_>> + '_> {
        match &self.rows {
            RowChanges::Insert(rows) => Box::new(rows.iter().map(|row| RowEvent::Insert { row })),
            RowChanges::Delete(rows) => Box::new(rows.iter().map(|row| RowEvent::Delete { row })),
            RowChanges::Update(pairs) => Box::new(pairs.iter().map(|p| RowEvent::Update {
                before: &p.before,
                after: &p.after,
            })),
        }
    }
}

/// A single affected row, as seen by a trigger condition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RowEvent<'a> {
    Insert { row: &'a Row },
    Update { before: &'a Row, after: &'a Row },
    Delete { row: &'a Row },
}

impl<'a> RowEvent<'a> {
    pub fn kind(&self) -> ChangeKind {
        match self {
            RowEvent::Insert { .. } => ChangeKind::Insert,
            RowEvent::Update { .. } => ChangeKind::Update,
            RowEvent::Delete { .. } => ChangeKind::Delete,
        }
    }

    /// The row image that exists after the change; the removed row for deletes.
    pub fn current(&self) -> &'a Row {
        match *self {
            RowEvent::Insert { row } | RowEvent::Delete { row } => row,
            RowEvent::Update { after, .. } => after,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, RowEvent::Delete { .. })
    }
}
