//! Engine data store contract
//!
//! All coordination between workers happens through the atomic operations
//! defined here; workers never talk to each other. Any backend that honors
//! the contract can arbitrate a fleet of crash-prone workers:
//!
//! - multi-step operations are atomic with respect to each other
//!   (serializable or equivalent isolation): concurrent
//!   [`EngineStore::try_acquire_partition`] calls never hand the same free or
//!   abandoned partition to two requesters, and
//!   [`EngineStore::insert_split_partition`] can never interleave with a
//!   concurrent progress report on the same partition without one of them
//!   failing with [`StoreError::Lock`]
//! - every mutating partition call re-validates the stored owner before
//!   writing, so once a lease is taken over, no further writes from the
//!   previous owner are accepted
//!
//! [`MemoryStore`] is the reference implementation; the SQLite backend in
//! [`crate::storage`] implements the same contract over a real database.

pub mod error;
pub mod memory;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::{Job, JobState, JobStatusReport, Partition, ProgressUpdate};

/// Atomic operations over jobs and partitions.
///
/// Every operation takes a cancellation signal and returns
/// [`StoreError::Cancelled`] when it fires before the operation runs.
#[async_trait]
pub trait EngineStore: Send + Sync {
    /// Number of jobs ever scheduled.
    async fn count_jobs(&self, cancel: &CancellationToken) -> StoreResult<u64>;

    /// Insert a new job. Fails with [`StoreError::DuplicateIdentifier`] when
    /// the id already exists.
    async fn insert_job(&self, job: Job, cancel: &CancellationToken) -> StoreResult<()>;

    /// Apply a named state transition at `timestamp` and return the updated
    /// job.
    ///
    /// Idempotent when `new_state` equals the stored state (returns the job
    /// unchanged); backward transitions fail with
    /// [`StoreError::InvalidTransition`]; an absent id fails with
    /// [`StoreError::UnknownIdentifier`].
    async fn update_job_state(
        &self,
        id: &str,
        timestamp: DateTime<Utc>,
        new_state: JobState,
        error: Option<String>,
        cancel: &CancellationToken,
    ) -> StoreResult<Job>;

    /// Fetch a job by id. Fails with [`StoreError::UnknownIdentifier`].
    async fn retrieve_job(&self, id: &str, cancel: &CancellationToken) -> StoreResult<Job>;

    /// Insert a new partition. Fails with
    /// [`StoreError::DuplicateIdentifier`] on id collision or
    /// [`StoreError::InvalidReference`] when the owning job does not exist.
    async fn insert_partition(
        &self,
        partition: Partition,
        cancel: &CancellationToken,
    ) -> StoreResult<()>;

    /// Fetch a partition by id. Fails with [`StoreError::UnknownIdentifier`].
    async fn retrieve_partition(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> StoreResult<Partition>;

    /// Atomically lease the most loaded acquirable partition of a job.
    ///
    /// Among partitions with (`owner` unset OR `updated < active_cutoff`)
    /// AND not completed, selects the one with the largest `remaining` (ties
    /// broken deterministically by id), assigns it to `requester` with a
    /// fresh heartbeat and a cleared split request, and returns it. Returns
    /// `None` when no candidate exists. Fails with
    /// [`StoreError::UnknownIdentifier`] when the job is absent.
    async fn try_acquire_partition(
        &self,
        job_id: &str,
        requester: &str,
        now: DateTime<Utc>,
        active_cutoff: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> StoreResult<Option<Partition>>;

    /// Atomically flag the most loaded actively-owned partition for
    /// splitting.
    ///
    /// Among partitions with a live lease (`owner` set AND
    /// `updated >= active_cutoff`), not completed and not already flagged,
    /// selects the one with the largest `remaining` and sets
    /// `is_split_requested`. Returns whether a candidate existed. Fails with
    /// [`StoreError::UnknownIdentifier`] when the job is absent.
    async fn try_request_split(
        &self,
        job_id: &str,
        active_cutoff: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> StoreResult<bool>;

    /// Record a progress report from `owner` and return the updated
    /// partition.
    ///
    /// Fails with [`StoreError::UnknownIdentifier`] when the partition is
    /// absent and with [`StoreError::Lock`] when the stored owner differs:
    /// the lease was taken over, and the caller must stop working on this
    /// partition. Reports against an already completed partition are ignored
    /// (completed partitions are immutable).
    async fn report_progress(
        &self,
        id: Uuid,
        owner: &str,
        now: DateTime<Utc>,
        update: ProgressUpdate,
        cancel: &CancellationToken,
    ) -> StoreResult<Partition>;

    /// Commit a split as a single transaction: shrink the owned partition to
    /// `update` and insert `insert` as a brand-new free partition. Both
    /// writes commit together or neither does.
    ///
    /// The shrink is guarded by the same owner check as
    /// [`EngineStore::report_progress`] and fails with [`StoreError::Lock`]
    /// when the lease was lost. Fails with
    /// [`StoreError::UnknownIdentifier`] when the update target is missing
    /// and [`StoreError::DuplicateIdentifier`] when the insert id already
    /// exists.
    async fn insert_split_partition(
        &self,
        update: Partition,
        insert: Partition,
        cancel: &CancellationToken,
    ) -> StoreResult<()>;

    /// Number of partitions of a job not yet completed. Fails with
    /// [`StoreError::UnknownIdentifier`].
    async fn count_incomplete_partitions(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<u64>;

    /// Aggregate status of a job and its partitions at `now`. Fails with
    /// [`StoreError::UnknownIdentifier`].
    async fn retrieve_job_status_report(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> StoreResult<JobStatusReport>;

    /// Transition a job to `Ready`.
    async fn mark_ready(
        &self,
        id: &str,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> StoreResult<Job> {
        self.update_job_state(id, now, JobState::Ready, None, cancel)
            .await
    }

    /// Transition a job to `Processing`.
    async fn mark_started(
        &self,
        id: &str,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> StoreResult<Job> {
        self.update_job_state(id, now, JobState::Processing, None, cancel)
            .await
    }

    /// Transition a job to `Completed`.
    async fn mark_completed(
        &self,
        id: &str,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> StoreResult<Job> {
        self.update_job_state(id, now, JobState::Completed, None, cancel)
            .await
    }

    /// Transition a job to `Failed` with an error description.
    async fn mark_failed(
        &self,
        id: &str,
        now: DateTime<Utc>,
        error: String,
        cancel: &CancellationToken,
    ) -> StoreResult<Job> {
        self.update_job_state(id, now, JobState::Failed, Some(error), cancel)
            .await
    }
}

/// Shared guard used by store implementations before touching state.
pub(crate) fn ensure_live(cancel: &CancellationToken) -> StoreResult<()> {
    if cancel.is_cancelled() {
        Err(StoreError::Cancelled)
    } else {
        Ok(())
    }
}

/// Aggregate a job's partitions into a [`JobStatusReport`].
///
/// Shared between backends so both classify lease liveness identically: a
/// partition with an owner whose heartbeat is at or past the job's active
/// cutoff counts as in-progress; anything else incomplete counts as
/// untouched (free or abandoned).
pub(crate) fn build_status_report<'a>(
    job: &Job,
    partitions: impl Iterator<Item = &'a Partition>,
    lease_takeovers: u64,
    now: DateTime<Utc>,
) -> JobStatusReport {
    let cutoff = job.active_cutoff(now);
    let mut report = JobStatusReport {
        job_id: job.id.clone(),
        state: job.state,
        started: job.started,
        completed: job.completed,
        partitions_untouched: 0,
        partitions_in_progress: 0,
        partitions_completed: 0,
        keys_completed: 0,
        keys_remaining: 0,
        throughput: 0.0,
        pending_splits: 0,
        lease_takeovers,
        last_activity: None,
    };

    for p in partitions {
        report.keys_completed += p.processed;
        if p.is_completed {
            report.partitions_completed += 1;
        } else {
            report.keys_remaining += p.remaining;
            if p.owner.is_some() && p.updated >= cutoff {
                report.partitions_in_progress += 1;
                report.throughput += p.throughput;
            } else {
                report.partitions_untouched += 1;
            }
            if p.is_split_requested {
                report.pending_splits += 1;
            }
        }
        report.last_activity = match report.last_activity {
            Some(t) if t >= p.updated => Some(t),
            _ => Some(p.updated),
        };
    }

    report
}
