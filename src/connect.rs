//! Wiring the MySQL collaborators into a running engine.

use std::sync::Arc;

use anyhow::{Context, Result};
use live_select::{ConnectionError, ConnectionEvent, ConnectionEvents, LiveSync};
use mysql_trigger_source::{new_mysql_pool, MySQLExecutor, MySQLTriggerSource};
use sync_core::StreamPosition;
use tracing::{error, info, warn};

use crate::{LiveOpts, SourceOpts};

/// Connection pool for the source database.
pub fn connect_mysql(opts: &SourceOpts) -> Result<mysql_async::Pool> {
    new_mysql_pool(&opts.source_uri, opts.source_database.as_deref())
}

/// Database being tracked: `--source-database`, else the URI's database.
pub fn database_name(opts: &SourceOpts) -> Result<String> {
    if let Some(db) = &opts.source_database {
        return Ok(db.clone());
    }
    let uri_opts =
        mysql_async::Opts::from_url(&opts.source_uri).context("Invalid MySQL connection URI")?;
    uri_opts
        .db_name()
        .map(str::to_string)
        .context("No database in the connection URI; pass --source-database")
}

/// Start an engine over the audit-table stream of the source database.
pub fn start_live(
    source_opts: &SourceOpts,
    live_opts: &LiveOpts,
    resume_from: Option<StreamPosition>,
) -> Result<(LiveSync, ConnectionEvents)> {
    let pool = connect_mysql(source_opts)?;
    let database = database_name(source_opts)?;
    info!(
        "Starting live sync on database {database} (server id {}, {} connection)",
        live_opts.server_id,
        if source_opts.pool { "pooled" } else { "single" }
    );

    let source = MySQLTriggerSource::new(pool.clone()).with_poll_interval(live_opts.poll_interval);
    let executor = MySQLExecutor::new(pool, source_opts.pool);
    let config = live_opts.to_config(database, resume_from);
    Ok(LiveSync::start(
        config,
        Arc::new(source),
        Arc::new(executor),
    ))
}

/// Why a CLI session stopped.
#[derive(Debug)]
pub enum Shutdown {
    Interrupted,
    Failed(ConnectionError),
}

/// Log connection events until Ctrl-C or a fatal stream failure.
pub async fn wait_for_shutdown(events: &mut ConnectionEvents) -> Shutdown {
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!("Failed to listen for Ctrl-C: {err}");
                }
                info!("Received interrupt signal (Ctrl+C)");
                return Shutdown::Interrupted;
            }
            event = events.recv() => match event {
                Some(ConnectionEvent::Ready) => info!("Change stream is live"),
                Some(ConnectionEvent::Error(err)) => {
                    error!("Change stream failed: {err}");
                    return Shutdown::Failed(err);
                }
                None => return Shutdown::Interrupted,
            },
        }
    }
}
