//! `live-sync setup`: install change tracking.

use anyhow::{Context, Result};
use mysql_trigger_source::{get_current_position, setup_mysql_change_tracking};
use tracing::info;

use crate::connect::{connect_mysql, database_name};
use crate::SourceOpts;

pub async fn run_setup(opts: &SourceOpts) -> Result<()> {
    let database = database_name(opts)?;
    let pool = connect_mysql(opts)?;
    let mut conn = pool
        .get_conn()
        .await
        .context("Failed to connect to MySQL")?;

    let tables = setup_mysql_change_tracking(&mut conn, &database).await?;
    for table in &tables {
        info!("Tracking {database}.{table}");
    }
    let position = get_current_position(&mut conn).await?;
    info!("Audit log currently ends at {position}");

    drop(conn);
    pool.disconnect().await?;
    Ok(())
}
