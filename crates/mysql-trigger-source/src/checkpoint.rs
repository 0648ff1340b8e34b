//! Positions in the audit table.
//!
//! A stream position for trigger-based capture is `(AUDIT_TABLE, sequence_id)`
//! where `sequence_id` is the last audit row consumed.

use anyhow::Result;
use mysql_async::prelude::Queryable;
use sync_core::StreamPosition;

use crate::change_tracking::AUDIT_TABLE;

/// `true` if the audit table exists in the connection's current database.
pub async fn audit_table_exists(conn: &mut mysql_async::Conn) -> Result<bool> {
    let found: Option<u8> = conn
        .exec_first(
            "SELECT 1 FROM information_schema.tables WHERE table_name = ? AND table_schema = DATABASE()",
            (AUDIT_TABLE,),
        )
        .await?;
    Ok(found.is_some())
}

/// Current end of the audit log.
///
/// Returns offset 0 when the audit table does not exist yet.
pub async fn get_current_position(conn: &mut mysql_async::Conn) -> Result<StreamPosition> {
    if !audit_table_exists(conn).await? {
        return Ok(StreamPosition::new(AUDIT_TABLE, 0));
    }

    let max: Option<u64> = conn
        .query_first(format!(
            "SELECT COALESCE(MAX(sequence_id), 0) FROM {AUDIT_TABLE}"
        ))
        .await?;

    Ok(StreamPosition::new(AUDIT_TABLE, max.unwrap_or(0)))
}

/// Offset to continue from when resuming at `position`.
pub(crate) fn resume_offset(position: &StreamPosition) -> Result<u64> {
    if position.filename != AUDIT_TABLE {
        anyhow::bail!(
            "Cannot resume from {position}: not a position in the {AUDIT_TABLE} audit table"
        );
    }
    Ok(position.offset)
}
