//! Background rebalancing loop
//!
//! Grows the number of independently leasable partitions toward a target by
//! periodically flagging the most loaded live partition for splitting. This
//! is pure policy: the protocol stays correct at any request rate, including
//! zero, because splits only ever detach unprocessed tails.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;
use crate::store::EngineStore;

/// Configuration for the rebalancing loop.
#[derive(Debug, Clone)]
pub struct RebalanceConfig {
    /// How often to re-evaluate the partition count
    pub interval: Duration,

    /// Desired number of concurrently leasable partitions, normally the
    /// number of worker slots expected to run the job
    pub target_partitions: u64,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            target_partitions: 4,
        }
    }
}

impl RebalanceConfig {
    pub fn new(target_partitions: u64) -> Self {
        Self {
            target_partitions,
            ..Default::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Periodically issues split requests to keep a job's partition count
/// matched to worker demand.
pub struct Rebalancer {
    store: Arc<dyn EngineStore>,
    config: RebalanceConfig,
}

impl Rebalancer {
    pub fn new(store: Arc<dyn EngineStore>, config: RebalanceConfig) -> Self {
        Self { store, config }
    }

    /// Run the loop until the job reaches a terminal state or `cancel`
    /// fires.
    pub async fn run(&self, job_id: &str, cancel: &CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.interval) => {}
            }

            let job = self.store.retrieve_job(job_id, cancel).await?;
            if job.state.is_terminal() {
                info!(job = %job_id, state = %job.state, "rebalancer stopping");
                return Ok(());
            }

            self.rebalance_once(job_id, cancel).await?;
        }
    }

    /// One evaluation step: request a split when the incomplete-partition
    /// count plus already-pending requests is below the target. Returns
    /// whether a split was requested.
    pub async fn rebalance_once(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let now = Utc::now();
        let job = self.store.retrieve_job(job_id, cancel).await?;
        let report = self
            .store
            .retrieve_job_status_report(job_id, now, cancel)
            .await?;

        let leasable = report.partitions_untouched + report.partitions_in_progress;
        if leasable + report.pending_splits >= self.config.target_partitions {
            return Ok(false);
        }

        let requested = self
            .store
            .try_request_split(job_id, job.active_cutoff(now), cancel)
            .await?;
        if requested {
            debug!(
                job = %job_id,
                leasable = leasable,
                target = self.config.target_partitions,
                "split requested"
            );
        }
        Ok(requested)
    }
}
