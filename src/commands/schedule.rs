//! Schedule a demo job

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::events::TracingSink;
use crate::keyspace::Int64Keys;
use crate::scheduler::Scheduler;
use crate::source::SequenceSource;
use crate::storage::SqliteStore;

/// Schedule a job over the demo integer range `[0, count)`.
pub async fn schedule_job(
    config: &Config,
    db: &Path,
    job_id: &str,
    count: u64,
) -> Result<()> {
    anyhow::ensure!(count > 0, "count must be at least 1");

    let store = Arc::new(SqliteStore::open(db).context("opening store")?);
    let scheduler = Scheduler::new(store, Arc::new(TracingSink));
    let source = SequenceSource::ascending(0, count as i64 - 1);
    let cancel = CancellationToken::new();

    let job = scheduler
        .schedule(
            &Int64Keys,
            &source,
            config.job_settings(job_id),
            &cancel,
        )
        .await
        .context("scheduling job")?;

    println!(
        "job {} scheduled: {} keys, batch size {}, lease timeout {}s",
        job.id,
        count,
        job.batch_size,
        job.batch_timeout_secs + job.clock_drift_secs,
    );
    Ok(())
}
