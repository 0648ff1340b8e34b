//! Audit table and triggers for trigger-based change capture.
//!
//! Every tracked table gets AFTER INSERT/UPDATE/DELETE triggers that append
//! the full before and after row images, as JSON objects, to one audit table
//! in the same database. The change stream tails that table in
//! `sequence_id` order.

use anyhow::{anyhow, Result};
use mysql_async::{prelude::*, Row};
use tracing::{info, warn};

/// Name of the audit table, also the `filename` of stream positions.
pub const AUDIT_TABLE: &str = "live_sync_changes";

const TRIGGER_PREFIX: &str = "live_sync";

/// Create the audit table and install triggers on every base table of
/// `database_name`. Returns the tables now tracked.
///
/// Safe to run repeatedly: existing triggers are kept.
pub async fn setup_mysql_change_tracking(
    conn: &mut mysql_async::Conn,
    database_name: &str,
) -> Result<Vec<String>> {
    let create_table = format!(
        "CREATE TABLE IF NOT EXISTS {db}.{AUDIT_TABLE} (
            sequence_id BIGINT UNSIGNED AUTO_INCREMENT PRIMARY KEY,
            schema_name VARCHAR(64) NOT NULL,
            table_name VARCHAR(64) NOT NULL,
            operation VARCHAR(10) NOT NULL,
            old_data JSON,
            new_data JSON,
            changed_at TIMESTAMP(6) DEFAULT CURRENT_TIMESTAMP(6)
        )",
        db = quote_identifier(database_name),
    );
    conn.query_drop(create_table).await?;

    let tables_query = "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES
                       WHERE TABLE_SCHEMA = ?
                       AND TABLE_TYPE = 'BASE TABLE'
                       AND TABLE_NAME != ?
                       ORDER BY TABLE_NAME";
    let table_rows: Vec<Row> = conn
        .exec(tables_query, (database_name, AUDIT_TABLE))
        .await?;

    let mut tracked = Vec::new();
    for row in table_rows {
        let table_name: String = row
            .get_opt(0)
            .and_then(Result::ok)
            .ok_or_else(|| anyhow!("Missing table name"))?;

        let columns = table_columns(conn, database_name, &table_name).await?;
        if columns.is_empty() {
            warn!("No columns found for table: {database_name}.{table_name}");
            continue;
        }

        create_triggers_for_table(conn, database_name, &table_name, &columns).await?;
        tracked.push(table_name);
    }

    info!(
        "Change tracking ready on {database_name}: {} tables",
        tracked.len()
    );
    Ok(tracked)
}

async fn table_columns(
    conn: &mut mysql_async::Conn,
    database_name: &str,
    table_name: &str,
) -> Result<Vec<String>> {
    let columns_query = "SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.COLUMNS
                        WHERE TABLE_NAME = ? AND TABLE_SCHEMA = ?
                        ORDER BY ORDINAL_POSITION";
    let column_rows: Vec<Row> = conn
        .exec(columns_query, (table_name, database_name))
        .await?;
    Ok(column_rows
        .into_iter()
        .filter_map(|row| row.get_opt::<String, _>(0).and_then(Result::ok))
        .collect())
}

/// Create the INSERT, UPDATE and DELETE triggers for one table.
pub async fn create_triggers_for_table(
    conn: &mut mysql_async::Conn,
    database_name: &str,
    table_name: &str,
    columns: &[String],
) -> Result<()> {
    for (operation, sql) in trigger_statements(database_name, table_name, columns) {
        match conn.query_drop(&sql).await {
            Ok(_) => info!("Created {operation} trigger for table: {table_name}"),
            Err(e) if e.to_string().contains("already exists") => {
                info!("{operation} trigger already exists for table: {table_name}");
            }
            Err(e) => {
                return Err(anyhow!(
                    "Failed to create {operation} trigger for {table_name}: {e}"
                ))
            }
        }
    }
    Ok(())
}

/// `(operation, CREATE TRIGGER statement)` for each captured operation.
fn trigger_statements(
    database_name: &str,
    table_name: &str,
    columns: &[String],
) -> [(&'static str, String); 3] {
    let image = |alias: &str| {
        let pairs = columns
            .iter()
            .map(|c| format!("{}, {alias}.{}", quote_literal(c), quote_identifier(c)))
            .collect::<Vec<_>>()
            .join(", ");
        format!("JSON_OBJECT({pairs})")
    };
    let new_image = image("NEW");
    let old_image = image("OLD");

    let db = quote_identifier(database_name);
    let table = quote_identifier(table_name);
    let schema_lit = quote_literal(database_name);
    let table_lit = quote_literal(table_name);
    let trigger = |op: &str| {
        quote_identifier(&format!(
            "{TRIGGER_PREFIX}_{}_{table_name}",
            op.to_ascii_lowercase()
        ))
    };

    let statement = |op: &'static str, old: &str, new: &str| {
        format!(
            "CREATE TRIGGER {db}.{name}
             AFTER {op} ON {db}.{table}
             FOR EACH ROW
             INSERT INTO {db}.{AUDIT_TABLE} (schema_name, table_name, operation, old_data, new_data)
             VALUES ({schema_lit}, {table_lit}, '{op}', {old}, {new})",
            name = trigger(op),
        )
    };

    [
        ("INSERT", statement("INSERT", "NULL", &new_image)),
        ("UPDATE", statement("UPDATE", &old_image, &new_image)),
        ("DELETE", statement("DELETE", &old_image, "NULL")),
    ]
}

pub(crate) fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}
