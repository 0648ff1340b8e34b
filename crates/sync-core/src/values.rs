//! Row and snapshot representations.
//!
//! Rows are column-name to JSON-value maps. JSON is the common denominator
//! between the execution transport, the change stream and subscribers, and
//! `serde_json::Value` gives deep equality for free, which the differ relies
//! on.

use std::collections::BTreeMap;

/// A single column value.
pub type Value = serde_json::Value;

/// One result or table row: column name to value.
pub type Row = BTreeMap<String, Value>;

/// Materialised result of a query (or a whole table), keyed by row key.
///
/// Insertion order carries no meaning; a `BTreeMap` keeps iteration and
/// serialisation deterministic.
pub type Snapshot = BTreeMap<String, Row>;

/// Build a row from `(column, value)` pairs.
///
/// ```rust
/// use sync_core::values::row;
/// use serde_json::json;
///
/// let r = row([("id", json!(1)), ("visits", json!(10))]);
/// assert_eq!(r["visits"], json!(10));
/// ```
pub fn row<K, I>(columns: I) -> Row
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
{
    columns.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Textual form of a single value used as a map key.
///
/// Strings are used verbatim, everything else uses its JSON rendering.
/// Returns `None` for null, which can never key a row.
pub fn value_key(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// `true` when a value can be bound as a positional query parameter.
pub fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}
