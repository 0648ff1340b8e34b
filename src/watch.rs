//! `live-sync watch`: follow one live select and print its changes.

use anyhow::{Context, Result};
use checkpoint::SyncPhase;
use clap::Args;
use live_select::{SelectEvent, Subscription};
use sync_core::{KeySelector, Trigger, Value};
use tracing::info;

use crate::connect::{start_live, wait_for_shutdown, Shutdown};
use crate::positions::{persist_position, resolve_resume_position};
use crate::{CheckpointOpts, LiveOpts, SourceOpts};

#[derive(Args, Clone, Debug)]
pub struct WatchArgs {
    /// SQL query to keep live
    #[arg(long)]
    pub query: String,

    /// Positional query parameter as JSON; bare words are strings (repeatable)
    #[arg(long = "param", value_name = "VALUE", value_parser = parse_param)]
    pub params: Vec<Value>,

    /// Column identifying a result row (repeatable). Rows are keyed by their
    /// position in the result when omitted
    #[arg(long = "key", value_name = "COLUMN")]
    pub key_columns: Vec<String>,

    /// Table whose changes refresh the query, as "table" or "schema.table" (repeatable)
    #[arg(long = "trigger", value_name = "TABLE", required = true)]
    pub triggers: Vec<String>,
}

/// Parse a `--param` value: JSON if it parses, else the raw string.
pub fn parse_param(s: &str) -> Result<Value, std::convert::Infallible> {
    Ok(serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string())))
}

/// Parse a `--trigger` value.
pub fn parse_trigger(s: &str) -> Result<Trigger> {
    let (schema, table) = match s.split_once('.') {
        Some((schema, table)) => (Some(schema), table),
        None => (None, s),
    };
    if table.is_empty() || schema.is_some_and(str::is_empty) {
        anyhow::bail!("Invalid trigger '{s}': expected 'table' or 'schema.table'");
    }
    let trigger = Trigger::new(table);
    Ok(match schema {
        Some(schema) => trigger.schema(schema),
        None => trigger,
    })
}

impl WatchArgs {
    pub fn key_selector(&self) -> KeySelector {
        if self.key_columns.is_empty() {
            KeySelector::index()
        } else {
            KeySelector::columns(&self.key_columns)
        }
    }

    pub fn trigger_list(&self) -> Result<Vec<Trigger>> {
        self.triggers.iter().map(|t| parse_trigger(t)).collect()
    }
}

/// One output line for a subscription event.
pub fn event_line(event: &SelectEvent) -> Result<String> {
    let value = match event {
        SelectEvent::Update { diff, data } => serde_json::json!({
            "event": "update",
            "rows": data.len(),
            "diff": serde_json::to_value(&**diff)?,
        }),
        SelectEvent::Error(err) => serde_json::json!({
            "event": "error",
            "message": format!("{err:#}"),
        }),
    };
    Ok(serde_json::to_string(&value)?)
}

async fn print_events(mut subscription: Subscription) -> Result<()> {
    while let Some(event) = subscription.recv().await {
        println!("{}", event_line(&event)?);
    }
    Ok(())
}

pub async fn run_watch(
    args: WatchArgs,
    source_opts: SourceOpts,
    live_opts: LiveOpts,
    checkpoint_opts: CheckpointOpts,
) -> Result<()> {
    let triggers = args.trigger_list()?;
    let resume_from = resolve_resume_position(&checkpoint_opts).await?;
    let (live, mut events) = start_live(&source_opts, &live_opts, resume_from)?;

    let subscription = live
        .select(
            args.query.clone(),
            args.params.clone(),
            args.key_selector(),
            triggers,
            live_opts.min_interval,
        )
        .context("Failed to register live select")?;
    info!("Watching {} as {}", args.query, subscription.id());
    let printer = tokio::spawn(print_events(subscription));

    let shutdown = wait_for_shutdown(&mut events).await;
    let phase = match &shutdown {
        Shutdown::Interrupted => SyncPhase::StreamStopped,
        Shutdown::Failed(_) => SyncPhase::StreamFailed,
    };
    persist_position(&checkpoint_opts, live.position(), phase).await?;
    live.end();
    printer.await.context("Event printer panicked")??;

    match shutdown {
        Shutdown::Interrupted => Ok(()),
        Shutdown::Failed(err) => Err(err.into()),
    }
}
