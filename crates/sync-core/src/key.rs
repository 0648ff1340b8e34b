//! Key selectors: how a result row maps to its snapshot key.

use std::sync::Arc;

use crate::values::{Row, Value};

/// Failure to derive a key for a row.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KeyError {
    #[error("key column '{column}' missing from row: {row}")]
    MissingColumn { column: String, row: String },

    #[error("key column '{column}' is null in row: {row}")]
    NullColumn { column: String, row: String },

    #[error("key function failed: {0}")]
    Custom(String),
}

/// Caller supplied key function: `(row, ordinal index) -> key`.
pub type KeyFn = Arc<dyn Fn(&Row, usize) -> Result<String, KeyError> + Send + Sync>;

#[derive(Clone)]
enum Kind {
    Index,
    Columns(Vec<String>),
    Func { tag: String, func: KeyFn },
}

/// Strategy for turning result rows into unique string keys.
///
/// Two selectors with the same [`tag`](KeySelector::tag) are interchangeable,
/// which is what lets identical live selects share one cache entry.
#[derive(Clone)]
pub struct KeySelector {
    kind: Kind,
}

impl KeySelector {
    /// Key rows by their position in the result set.
    ///
    /// Cheap, but any insert or delete ahead of a row shifts every key after
    /// it, so the resulting diffs report changes rather than moves.
    pub fn index() -> Self {
        Self { kind: Kind::Index }
    }

    /// Key rows by one or more columns. Column order does not matter.
    pub fn columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        columns.sort();
        columns.dedup();
        Self {
            kind: Kind::Columns(columns),
        }
    }

    /// Key rows with a custom function.
    ///
    /// `tag` names the function for cache sharing: selects that pass the same
    /// tag must pass equivalent functions.
    pub fn func<F>(tag: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Row, usize) -> Result<String, KeyError> + Send + Sync + 'static,
    {
        Self {
            kind: Kind::Func {
                tag: tag.into(),
                func: Arc::new(func),
            },
        }
    }

    /// Identity of this selector inside a cache key.
    pub fn tag(&self) -> String {
        match &self.kind {
            Kind::Index => "index".to_string(),
            Kind::Columns(columns) => format!("columns: {}", columns.join(",")),
            Kind::Func { tag, .. } => format!("func: {tag}"),
        }
    }

    /// Sorted key columns, for column selectors.
    pub fn key_columns(&self) -> Option<&[String]> {
        match &self.kind {
            Kind::Columns(columns) => Some(columns),
            _ => None,
        }
    }

    /// Derive the key for `row`, the `index`-th row of its result set.
    pub fn key_for(&self, row: &Row, index: usize) -> Result<String, KeyError> {
        match &self.kind {
            Kind::Index => Ok(index.to_string()),
            Kind::Func { func, .. } => func(row, index),
            Kind::Columns(columns) if columns.len() == 1 => {
                let value = key_value(row, &columns[0])?;
                Ok(match value {
                    Value::String(s) => format!("\"{s}\""),
                    Value::Object(_) | Value::Array(_) => format!("!{}", canonical_json(value)),
                    other => other.to_string(),
                })
            }
            Kind::Columns(columns) => {
                let mut picked = serde_json::Map::new();
                for column in columns {
                    picked.insert(column.clone(), key_value(row, column)?.clone());
                }
                Ok(format!("!{}", canonical_json(&Value::Object(picked))))
            }
        }
    }
}

impl std::fmt::Debug for KeySelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("KeySelector").field(&self.tag()).finish()
    }
}

fn key_value<'a>(row: &'a Row, column: &str) -> Result<&'a Value, KeyError> {
    match row.get(column) {
        None => Err(KeyError::MissingColumn {
            column: column.to_string(),
            row: canonical_row(row),
        }),
        Some(Value::Null) => Err(KeyError::NullColumn {
            column: column.to_string(),
            row: canonical_row(row),
        }),
        Some(value) => Ok(value),
    }
}

fn canonical_row(row: &Row) -> String {
    let object = row
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<serde_json::Map<_, _>>();
    canonical_json(&Value::Object(object))
}

/// JSON rendering with object keys sorted at every level.
///
/// Independent of whether `serde_json` was built with `preserve_order`.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
