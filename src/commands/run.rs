//! Run worker slots against a job

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::engine::ProcessingEngine;
use crate::events::TracingSink;
use crate::keyspace::Int64Keys;
use crate::scheduler::{RebalanceConfig, Rebalancer};
use crate::source::{RecordingProcessor, SequenceSource};
use crate::storage::SqliteStore;

/// Run `slots` worker slots against `job_id` until it completes or ctrl-c.
///
/// Each slot is an independent engine instance sharing only the store; a
/// rebalancer keeps the partition count matched to the slot count so all
/// slots find work.
pub async fn run_workers(
    config: &Config,
    db: &Path,
    job_id: &str,
    slots: usize,
    count: u64,
) -> Result<()> {
    anyhow::ensure!(slots > 0, "at least one worker slot is required");

    let store = Arc::new(SqliteStore::open(db).context("opening store")?);
    let source = Arc::new(SequenceSource::ascending(0, count as i64 - 1));
    let processor = Arc::new(RecordingProcessor::new());
    let keys = Arc::new(Int64Keys);
    let sink = Arc::new(TracingSink);

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            ctrl_c_cancel.cancel();
        }
    });

    let rebalancer = Rebalancer::new(
        store.clone(),
        RebalanceConfig::new(slots as u64)
            .with_interval(std::time::Duration::from_secs(2)),
    );
    let rebalance_cancel = cancel.clone();
    let rebalance_job = job_id.to_string();
    let rebalance_handle = tokio::spawn(async move {
        if let Err(e) = rebalancer.run(&rebalance_job, &rebalance_cancel).await {
            tracing::warn!(error = %e, "rebalancer stopped with error");
        }
    });

    let mut handles = Vec::with_capacity(slots);
    for slot in 0..slots {
        let engine = ProcessingEngine::new(
            store.clone(),
            keys.clone(),
            source.clone(),
            processor.clone(),
            sink.clone(),
            config.engine_config(format!("{}-{}", hostname(), slot)),
        );
        let job = job_id.to_string();
        let slot_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            engine.run(&job, &slot_cancel).await
        }));
    }

    let results = futures::future::join_all(handles).await;
    cancel.cancel();
    let _ = rebalance_handle.await;
    for result in results {
        result.context("worker slot panicked")??;
    }

    println!(
        "workers finished: {} items processed in {} batches",
        processor.total(),
        processor.batches()
    );
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("pid{}", std::process::id()))
}
