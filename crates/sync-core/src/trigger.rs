//! Triggers decide which change events are relevant to a live select.

use std::sync::Arc;

use crate::change::{ChangeEvent, RowEvent};

/// Row-level predicate. Receives each affected row of a matching event.
pub type Condition = Arc<dyn Fn(&RowEvent<'_>) -> bool + Send + Sync>;

/// A table to watch, optionally narrowed by a row predicate.
///
/// ```rust
/// use sync_core::{RowEvent, Trigger};
/// use serde_json::json;
///
/// // Only react to rows of player 7
/// let trigger = Trigger::new("scores")
///     .schema("game")
///     .when(|ev: &RowEvent<'_>| ev.current().get("player_id") == Some(&json!(7)));
/// ```
#[derive(Clone)]
pub struct Trigger {
    schema: Option<String>,
    table: String,
    condition: Option<Condition>,
}

impl Trigger {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            schema: None,
            table: table.into(),
            condition: None,
        }
    }

    /// Watch the table in `schema` instead of the connection's default schema.
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&RowEvent<'_>) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Explicit schema, else `default`. `None` means the trigger can never match.
    pub fn resolve_schema<'a>(&'a self, default: Option<&'a str>) -> Option<&'a str> {
        self.schema.as_deref().or(default)
    }

    pub fn has_condition(&self) -> bool {
        self.condition.is_some()
    }

    /// Whether `event` is relevant to this trigger.
    ///
    /// Same table and no condition matches immediately; otherwise the first
    /// row satisfying the condition does.
    pub fn matches(&self, event: &ChangeEvent, default_schema: Option<&str>) -> bool {
        let Some(schema) = self.resolve_schema(default_schema) else {
            return false;
        };
        if !event.is_for(schema, &self.table) {
            return false;
        }
        match &self.condition {
            None => true,
            Some(condition) => event.row_events().any(|row| condition(&row)),
        }
    }
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger")
            .field("schema", &self.schema)
            .field("table", &self.table)
            .field("has_condition", &self.condition.is_some())
            .finish()
    }
}

/// `true` if any trigger matches `event` (logical OR).
pub fn matches(event: &ChangeEvent, triggers: &[Trigger], default_schema: Option<&str>) -> bool {
    triggers.iter().any(|t| t.matches(event, default_schema))
}
