//! Contract of the SQL execution transport.

use async_trait::async_trait;

use crate::values::{Row, Value};

/// Runs a parameterised query and returns its rows in result order.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &str, params: &[Value]) -> anyhow::Result<Vec<Row>>;

    /// Release connections. Called once when the owning engine ends.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
