//! `live-sync mirror`: keep a whole table in memory.

use std::time::Duration;

use anyhow::Result;
use checkpoint::SyncPhase;
use clap::Args;
use live_select::TableMirror;
use tracing::{info, warn};

use crate::connect::{start_live, wait_for_shutdown, Shutdown};
use crate::positions::{persist_position, resolve_resume_position};
use crate::{CheckpointOpts, LiveOpts, SourceOpts};

#[derive(Args, Clone, Debug)]
pub struct MirrorArgs {
    /// Table to mirror
    #[arg(long)]
    pub table: String,

    /// Schema of the table (defaults to the source database)
    #[arg(long)]
    pub schema: Option<String>,

    /// Column keying the mirrored rows
    #[arg(long, default_value = "id")]
    pub key_column: String,
}

/// JSON line describing the mirror's current contents.
pub fn mirror_line(event: &str, mirror: &TableMirror) -> Result<String> {
    let line = mirror.with_data(|data| {
        serde_json::to_string(&serde_json::json!({
            "event": event,
            "table": format!("{}.{}", mirror.schema(), mirror.table()),
            "rows": data.len(),
            "data": data,
        }))
    })?;
    Ok(line)
}

async fn announce_when_loaded(mirror: TableMirror) -> Result<()> {
    let mut poll = tokio::time::interval(Duration::from_millis(100));
    loop {
        poll.tick().await;
        if mirror.is_ready() {
            println!("{}", mirror_line("ready", &mirror)?);
            return Ok(());
        }
        if let Some(err) = mirror.load_error() {
            warn!("Mirror of {}.{} failed to load: {err}", mirror.schema(), mirror.table());
            return Ok(());
        }
    }
}

pub async fn run_mirror(
    args: MirrorArgs,
    source_opts: SourceOpts,
    live_opts: LiveOpts,
    checkpoint_opts: CheckpointOpts,
) -> Result<()> {
    let resume_from = resolve_resume_position(&checkpoint_opts).await?;
    let (live, mut events) = start_live(&source_opts, &live_opts, resume_from)?;

    let mirror = live.create_table_mirror(args.schema.as_deref(), &args.table, &args.key_column)?;
    info!(
        "Mirroring {}.{} keyed by {}",
        mirror.schema(),
        mirror.table(),
        mirror.key_column()
    );
    let loaded = tokio::spawn(announce_when_loaded(mirror.clone()));

    let shutdown = wait_for_shutdown(&mut events).await;
    loaded.abort();
    let phase = match &shutdown {
        Shutdown::Interrupted => SyncPhase::StreamStopped,
        Shutdown::Failed(_) => SyncPhase::StreamFailed,
    };
    persist_position(&checkpoint_opts, live.position(), phase).await?;
    live.end();

    if mirror.is_ready() {
        println!("{}", mirror_line("final", &mirror)?);
    }
    match shutdown {
        Shutdown::Interrupted => Ok(()),
        Shutdown::Failed(err) => Err(err.into()),
    }
}
