//! MySQL execution transport.
//!
//! [`MySQLExecutor`] runs live-select queries as prepared statements, either
//! on connections borrowed from a pool or on one dedicated connection that
//! executions take turns on. Result columns are converted to JSON values
//! shaped like the row images the audit triggers record, so a row read by a
//! query and the same row seen in a change event compare equal.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use chrono::NaiveDate;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Column, Conn, Opts, OptsBuilder, Params, Pool, Value as MySqlValue};
use sync_core::{QueryExecutor, Row, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Create a new MySQL connection pool, optionally overriding the database
/// named in the URI.
pub fn new_mysql_pool(connection_string: &str, database: Option<&str>) -> Result<Pool> {
    let opts = Opts::from_url(connection_string).context("Invalid MySQL connection URI")?;
    let opts = match database {
        Some(db) => Opts::from(OptsBuilder::from_opts(opts).db_name(Some(db))),
        None => opts,
    };
    Ok(Pool::new(opts))
}

/// [`QueryExecutor`] over `mysql_async`.
pub struct MySQLExecutor {
    pool: Pool,
    /// Connection shared by every execution when not pooling. Reopened
    /// lazily after a failure.
    dedicated: Option<Mutex<Option<Conn>>>,
}

impl MySQLExecutor {
    /// Each execution borrows its own connection from `pool`.
    pub fn pooled(pool: Pool) -> Self {
        Self {
            pool,
            dedicated: None,
        }
    }

    /// Executions are serialised on a single connection taken from `pool`.
    pub fn single(pool: Pool) -> Self {
        Self {
            pool,
            dedicated: Some(Mutex::new(None)),
        }
    }

    pub fn new(pool: Pool, use_pool: bool) -> Self {
        if use_pool {
            Self::pooled(pool)
        } else {
            Self::single(pool)
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl QueryExecutor for MySQLExecutor {
    async fn execute(&self, query: &str, params: &[Value]) -> Result<Vec<Row>> {
        let params = to_params(params)?;
        debug!("Executing live select: {query}");

        let rows: Vec<mysql_async::Row> = match &self.dedicated {
            None => {
                let mut conn = self
                    .pool
                    .get_conn()
                    .await
                    .context("Failed to get MySQL connection")?;
                conn.exec::<mysql_async::Row, _, _>(query, params).await?
            }
            Some(slot) => {
                let mut slot = slot.lock().await;
                let mut conn = match slot.take() {
                    Some(conn) => conn,
                    None => self
                        .pool
                        .get_conn()
                        .await
                        .context("Failed to open MySQL connection")?,
                };
                // A connection that failed a query is dropped, not reused.
                let rows = conn.exec::<mysql_async::Row, _, _>(query, params).await?;
                *slot = Some(conn);
                rows
            }
        };

        Ok(rows.iter().map(convert_row).collect())
    }

    async fn close(&self) -> Result<()> {
        if let Some(slot) = &self.dedicated {
            if let Some(conn) = slot.lock().await.take() {
                if let Err(err) = conn.disconnect().await {
                    warn!("Failed to disconnect MySQL connection: {err}");
                }
            }
        }
        self.pool
            .clone()
            .disconnect()
            .await
            .context("Failed to disconnect MySQL pool")?;
        info!("MySQL executor closed");
        Ok(())
    }
}

fn to_params(params: &[Value]) -> Result<Params> {
    if params.is_empty() {
        return Ok(Params::Empty);
    }
    let values = params
        .iter()
        .enumerate()
        .map(|(index, value)| to_mysql_value(index, value))
        .collect::<Result<Vec<_>>>()?;
    Ok(Params::Positional(values))
}

fn to_mysql_value(index: usize, value: &Value) -> Result<MySqlValue> {
    Ok(match value {
        Value::Null => MySqlValue::NULL,
        Value::Bool(b) => MySqlValue::Int(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                MySqlValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                MySqlValue::UInt(u)
            } else {
                n.as_f64()
                    .map(MySqlValue::Double)
                    .ok_or_else(|| anyhow::anyhow!("Parameter {index}: unsupported number {n}"))?
            }
        }
        Value::String(s) => MySqlValue::Bytes(s.as_bytes().to_vec()),
        Value::Array(_) | Value::Object(_) => {
            anyhow::bail!("Parameter {index} is not a scalar value")
        }
    })
}

pub(crate) fn convert_row(row: &mysql_async::Row) -> Row {
    row.columns_ref()
        .iter()
        .enumerate()
        .map(|(index, column)| {
            let value = row
                .as_ref(index)
                .map_or(Value::Null, |raw| convert_value(column, raw));
            (column.name_str().to_string(), value)
        })
        .collect()
}

pub(crate) fn convert_value(column: &Column, raw: &MySqlValue) -> Value {
    match raw {
        MySqlValue::NULL => Value::Null,
        MySqlValue::Int(i) => Value::from(*i),
        MySqlValue::UInt(u) => Value::from(*u),
        MySqlValue::Float(f) => float(f64::from(*f)),
        MySqlValue::Double(d) => float(*d),
        MySqlValue::Date(year, month, day, hour, minute, second, micros) => {
            let date_only = matches!(
                column.column_type(),
                ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE
            );
            Value::String(format_date(
                date_only, *year, *month, *day, *hour, *minute, *second, *micros,
            ))
        }
        MySqlValue::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if *negative { "-" } else { "" };
            let hours = u64::from(*days) * 24 + u64::from(*hours);
            Value::String(format!(
                "{sign}{hours:02}:{minutes:02}:{seconds:02}.{micros:06}"
            ))
        }
        MySqlValue::Bytes(bytes) => convert_bytes(column.column_type(), bytes),
    }
}

fn float(f: f64) -> Value {
    serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number)
}

#[allow(clippy::too_many_arguments)]
fn format_date(
    date_only: bool,
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
    micros: u32,
) -> String {
    let date = NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day));
    match date {
        Some(date) if date_only => date.format("%Y-%m-%d").to_string(),
        Some(date) => match date.and_hms_micro_opt(
            u32::from(hour),
            u32::from(minute),
            u32::from(second),
            micros,
        ) {
            Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            None => date.format("%Y-%m-%d").to_string(),
        },
        // Zero dates have no calendar representation.
        None if date_only => format!("{year:04}-{month:02}-{day:02}"),
        None => format!(
            "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}"
        ),
    }
}

/// Values in text form (text protocol, JSON, DECIMAL) interpreted by column type.
fn convert_bytes(column_type: ColumnType, bytes: &[u8]) -> Value {
    let text = || String::from_utf8_lossy(bytes).into_owned();
    match column_type {
        ColumnType::MYSQL_TYPE_JSON => serde_json::from_slice(bytes).unwrap_or_else(|err| {
            warn!("Failed to parse JSON column value: {err}");
            Value::String(text())
        }),
        ColumnType::MYSQL_TYPE_NEWDECIMAL
        | ColumnType::MYSQL_TYPE_DECIMAL
        | ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR
        | ColumnType::MYSQL_TYPE_FLOAT
        | ColumnType::MYSQL_TYPE_DOUBLE => {
            let s = text();
            s.parse::<serde_json::Number>()
                .map_or(Value::String(s), Value::Number)
        }
        _ => match std::str::from_utf8(bytes) {
            Ok(s) => Value::String(s.to_string()),
            Err(_) => Value::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_params_are_positional_scalars() {
        assert_eq!(to_params(&[]).unwrap(), Params::Empty);
        let params = to_params(&[json!(1), json!("a"), json!(true), json!(null), json!(1.5)]).unwrap();
        assert_eq!(
            params,
            Params::Positional(vec![
                MySqlValue::Int(1),
                MySqlValue::Bytes(b"a".to_vec()),
                MySqlValue::Int(1),
                MySqlValue::NULL,
                MySqlValue::Double(1.5),
            ])
        );
        assert_eq!(
            to_params(&[json!(u64::MAX)]).unwrap(),
            Params::Positional(vec![MySqlValue::UInt(u64::MAX)])
        );
        assert!(to_params(&[json!(1), json!({"a": 1})]).is_err());
        assert!(to_params(&[json!([1])]).is_err());
    }

    #[test]
    fn test_text_values_follow_column_type() {
        assert_eq!(
            convert_bytes(ColumnType::MYSQL_TYPE_JSON, br#"{"a":[1,2]}"#),
            json!({"a": [1, 2]})
        );
        assert_eq!(convert_bytes(ColumnType::MYSQL_TYPE_LONGLONG, b"-42"), json!(-42));
        assert_eq!(convert_bytes(ColumnType::MYSQL_TYPE_NEWDECIMAL, b"12.50"), json!(12.5));
        assert_eq!(
            convert_bytes(ColumnType::MYSQL_TYPE_VAR_STRING, b"hello"),
            json!("hello")
        );
        assert_eq!(
            convert_bytes(ColumnType::MYSQL_TYPE_BLOB, &[0xff, 0x00]),
            json!("/wA=")
        );
        assert_eq!(
            convert_bytes(ColumnType::MYSQL_TYPE_JSON, b"not json"),
            json!("not json")
        );
    }

    #[test]
    fn test_date_formats() {
        assert_eq!(format_date(true, 2024, 1, 15, 0, 0, 0, 0), "2024-01-15");
        assert_eq!(
            format_date(false, 2024, 1, 15, 10, 30, 5, 250),
            "2024-01-15 10:30:05.000250"
        );
        assert_eq!(format_date(true, 0, 0, 0, 0, 0, 0, 0), "0000-00-00");
    }
}
