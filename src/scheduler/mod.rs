//! Job scheduling
//!
//! The scheduler bootstraps a job (insert the job record, ask the data
//! source for its entire key range and a size estimate, insert one partition
//! spanning the whole range, mark the job ready) and serves aggregated
//! status. A background [`Rebalancer`] can grow the number of independently
//! leasable partitions to match worker demand; it is policy layered on the
//! protocol, never required for correctness.
//!
//! ```text
//! Scheduler ──bootstrap──▶ Store ◀──lease/progress/split──▶ N × Engine
//!     │                      ▲
//!     └─────rebalance────────┘
//! ```

pub mod rebalance;

pub use rebalance::{RebalanceConfig, Rebalancer};

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::events::{EngineEvent, EventSink};
use crate::keyspace::KeySpace;
use crate::models::{Job, JobStatusReport, Partition};
use crate::source::DataSource;
use crate::store::EngineStore;

/// Parameters for a new job.
#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Unique, externally chosen job id
    pub id: String,

    /// Maximum items per batch
    pub batch_size: usize,

    /// Upper bound on one batch cycle, in seconds
    pub batch_timeout_secs: i64,

    /// Clock tolerance between workers and the store, in seconds
    pub clock_drift_secs: i64,
}

impl JobSettings {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            batch_size: 100,
            batch_timeout_secs: 30,
            clock_drift_secs: 5,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_batch_timeout_secs(mut self, secs: i64) -> Self {
        self.batch_timeout_secs = secs;
        self
    }

    pub fn with_clock_drift_secs(mut self, secs: i64) -> Self {
        self.clock_drift_secs = secs;
        self
    }
}

/// Creates jobs and serves their aggregated status.
pub struct Scheduler {
    store: Arc<dyn EngineStore>,
    sink: Arc<dyn EventSink>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn EngineStore>, sink: Arc<dyn EventSink>) -> Self {
        Self { store, sink }
    }

    /// Bootstrap a job over the data source's entire key range.
    ///
    /// Fails with [`crate::store::StoreError::DuplicateIdentifier`] when the
    /// job id is already scheduled. A failure after the job record was
    /// inserted (the source refused, the partition insert failed) marks the
    /// job `Failed` on a best-effort basis before surfacing the error.
    pub async fn schedule<K, D>(
        &self,
        keys: &K,
        source: &D,
        settings: JobSettings,
        cancel: &CancellationToken,
    ) -> Result<Job>
    where
        K: KeySpace,
        D: DataSource<Key = K::Key>,
    {
        let now = Utc::now();
        let job = Job::new(
            settings.id,
            now,
            settings.batch_size,
            settings.batch_timeout_secs,
            settings.clock_drift_secs,
        );
        self.store.insert_job(job.clone(), cancel).await?;

        match self.bootstrap_partition(keys, source, &job, cancel).await {
            Ok(ready) => Ok(ready),
            Err(e) => {
                if let Err(mark_err) = self
                    .store
                    .mark_failed(&job.id, Utc::now(), e.to_string(), cancel)
                    .await
                {
                    warn!(job = %job.id, error = %mark_err, "could not mark failed job");
                }
                Err(e)
            }
        }
    }

    async fn bootstrap_partition<K, D>(
        &self,
        keys: &K,
        source: &D,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<Job>
    where
        K: KeySpace,
        D: DataSource<Key = K::Key>,
    {
        let range = source.entire_range(cancel).await?;
        let estimate = source.estimate_size(&range, cancel).await?;

        let partition = Partition::new(
            &job.id,
            range.map(|k| keys.serialize(k)),
            estimate,
            Utc::now(),
        );
        self.store.insert_partition(partition.clone(), cancel).await?;
        self.sink.emit(EngineEvent::PartitionCreated {
            job_id: job.id.clone(),
            partition_id: partition.id,
        });

        let ready = self.store.mark_ready(&job.id, Utc::now(), cancel).await?;
        info!(
            job = %job.id,
            estimate = estimate,
            first = %partition.range.first,
            last = %partition.range.last,
            "job scheduled"
        );
        Ok(ready)
    }

    /// Aggregated status of a job. Fails with
    /// [`crate::store::StoreError::UnknownIdentifier`] when the job does not
    /// exist.
    pub async fn get_job_state(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<JobStatusReport> {
        Ok(self
            .store
            .retrieve_job_status_report(id, Utc::now(), cancel)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopSink;
    use crate::keyspace::Int64Keys;
    use crate::models::JobState;
    use crate::source::SequenceSource;
    use crate::store::{MemoryStore, StoreError};

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    fn scheduler() -> (Scheduler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (
            Scheduler::new(store.clone(), Arc::new(NoopSink)),
            store,
        )
    }

    #[tokio::test]
    async fn test_schedule_bootstraps_single_partition() {
        let (scheduler, store) = scheduler();
        let source = SequenceSource::ascending(0, 999);

        let job = scheduler
            .schedule(&Int64Keys, &source, JobSettings::new("j1"), &token())
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Ready);

        let report = scheduler.get_job_state("j1", &token()).await.unwrap();
        assert_eq!(report.partitions_untouched, 1);
        assert_eq!(report.keys_remaining, 1000);
        assert_eq!(
            store.count_incomplete_partitions("j1", &token()).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_schedule_rejects_duplicate_id() {
        let (scheduler, _store) = scheduler();
        let source = SequenceSource::ascending(0, 99);

        scheduler
            .schedule(&Int64Keys, &source, JobSettings::new("j1"), &token())
            .await
            .unwrap();
        let err = scheduler
            .schedule(&Int64Keys, &source, JobSettings::new("j1"), &token())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Store(StoreError::DuplicateIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn test_get_job_state_unknown_job() {
        let (scheduler, _store) = scheduler();
        let err = scheduler.get_job_state("nope", &token()).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Store(StoreError::UnknownIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn test_settings_carried_onto_job() {
        let (scheduler, store) = scheduler();
        let source = SequenceSource::ascending(0, 99);
        let settings = JobSettings::new("j1")
            .with_batch_size(25)
            .with_batch_timeout_secs(60)
            .with_clock_drift_secs(10);

        scheduler
            .schedule(&Int64Keys, &source, settings, &token())
            .await
            .unwrap();
        let job = store.retrieve_job("j1", &token()).await.unwrap();
        assert_eq!(job.batch_size, 25);
        assert_eq!(job.batch_timeout_secs, 60);
        assert_eq!(job.clock_drift_secs, 10);
    }
}
