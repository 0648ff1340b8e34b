//! Core types for live-sync.
//!
//! - [`values`] - rows, snapshots and the JSON value model
//! - [`change`] - decoded row-level change events
//! - [`diff`] - structural diff/apply between snapshots
//! - [`key`] - key selectors mapping result rows to snapshot keys
//! - [`trigger`] - table/condition triggers and event matching
//! - [`stream`] / [`executor`] - contracts of the CDC stream and SQL transport
//!
//! # Architecture
//!
//! ```text
//! sync-core (this crate)
//!    │
//!    ├─── live-select            (engine: stream manager, query caches, mirrors)
//!    └─── mysql-trigger-source   (implements ChangeStreamSource + QueryExecutor)
//! ```
//!
//! # Example
//!
//! ```rust
//! use sync_core::{apply_diff, diff, values::row, Snapshot};
//! use serde_json::json;
//!
//! let old: Snapshot = [("1".to_string(), row([("visits", json!(10))]))].into();
//! let new: Snapshot = [("1".to_string(), row([("visits", json!(15))]))].into();
//!
//! let mut data = old.clone();
//! apply_diff(&mut data, &diff(&old, &new));
//! assert_eq!(data, new);
//! ```

pub mod change;
pub mod diff;
pub mod executor;
pub mod key;
pub mod position;
pub mod stream;
pub mod trigger;
pub mod values;

pub use change::{ChangeEvent, ChangeKind, RowChanges, RowEvent, RowPair};
pub use diff::{apply_diff, diff, Diff, FieldChange, RowDelta};
pub use executor::QueryExecutor;
pub use key::{canonical_json, KeyError, KeySelector};
pub use position::StreamPosition;
pub use stream::{
    ChangeStream, ChangeStreamSource, SchemaFilter, StreamConfig, StreamEvent, StreamEvents,
};
pub use trigger::{Condition, Trigger};
pub use values::{Row, Snapshot, Value};
