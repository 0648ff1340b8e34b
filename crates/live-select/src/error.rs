//! Error types surfaced by the engine.

use thiserror::Error;

/// Rejected `select` or `create_table_mirror` call. Raised synchronously.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectError {
    #[error("query must be a non-empty string")]
    EmptyQuery,

    #[error("query parameter {index} must be a scalar value")]
    InvalidParam { index: usize },

    #[error("column key selector requires at least one column")]
    EmptyKeyColumns,

    #[error("triggers array required")]
    MissingTriggers,

    #[error("no schema selected for table '{table}'")]
    NoSchema { table: String },

    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("live sync connection has been ended")]
    Closed,
}

/// Fatal connection failure. Delivered once on the connection event channel;
/// the engine does not retry after it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("change stream did not become ready within the initialization timeout")]
    InitTimeout,

    #[error("change stream reconnect failed after {attempts} attempts")]
    ReconnectFailure { attempts: u32 },
}
