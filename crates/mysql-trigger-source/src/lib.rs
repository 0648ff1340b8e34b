//! MySQL collaborators for live-sync.
//!
//! - [`MySQLExecutor`] runs live-select queries over `mysql_async`, pooled
//!   or on one dedicated connection.
//! - [`MySQLTriggerSource`] is a change stream built on an audit table that
//!   per-table triggers fill with full row images. Works with MySQL 5.7+
//!   without binlog access.
//!
//! Run [`setup_mysql_change_tracking`] once per database before streaming.

mod change_tracking;
pub mod checkpoint;
mod client;
mod source;
pub mod testing;

pub use change_tracking::{create_triggers_for_table, setup_mysql_change_tracking, AUDIT_TABLE};
pub use checkpoint::{audit_table_exists, get_current_position};
pub use client::{new_mysql_pool, MySQLExecutor};
pub use source::{
    MySQLTriggerSource, MySQLTriggerStream, DEFAULT_BATCH_SIZE, DEFAULT_POLL_INTERVAL,
};
