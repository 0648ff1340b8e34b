//! Live selects over a MySQL change stream.
//!
//! A [`LiveSync`] consumes one change-data-capture stream and keeps any
//! number of SQL query results current. Each distinct query is cached once;
//! change events that match a subscriber's [`Trigger`](sync_core::Trigger)s
//! cause a throttled, single-flight re-execution and subscribers receive the
//! structural [`Diff`](sync_core::Diff) against the previous result together
//! with the new snapshot.
//!
//! The stream is reconnected automatically, resuming from the last consumed
//! position. After three consecutive failed reconnects (or a stream that
//! never becomes ready) the connection reports a fatal [`ConnectionError`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use live_select::{LiveConfig, LiveSync, SelectEvent};
//! use sync_core::{ChangeStreamSource, KeySelector, QueryExecutor, Trigger};
//!
//! async fn watch(
//!     source: Arc<dyn ChangeStreamSource>,
//!     executor: Arc<dyn QueryExecutor>,
//! ) -> anyhow::Result<()> {
//!     let config = LiveConfig::new(1).with_default_schema("app");
//!     let (live, _events) = LiveSync::start(config, source, executor);
//!
//!     let mut sub = live.select(
//!         "SELECT * FROM players ORDER BY score DESC LIMIT 10",
//!         vec![],
//!         KeySelector::columns(["id"]),
//!         vec![Trigger::new("players")],
//!         None,
//!     )?;
//!     while let Some(event) = sub.recv().await {
//!         if let SelectEvent::Update { diff, .. } = event {
//!             println!("{}", serde_json::to_string(&*diff)?);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
mod dispatcher;
mod engine;
pub mod error;
mod live;
pub mod mirror;
mod query_cache;
pub mod subscription;
#[doc(hidden)]
pub mod testing;

pub use config::{LiveConfig, ReconnectPolicy};
pub use connection::StreamState;
pub use error::{ConnectionError, SelectError};
pub use live::{ConnectionEvent, ConnectionEvents, LiveSync};
pub use mirror::TableMirror;
pub use subscription::{SelectEvent, Subscription, SubscriptionId};
