//! In-memory reference implementation of the engine data store
//!
//! A single mutex over the whole interior state makes every operation
//! trivially serializable, which is exactly the isolation level the contract
//! demands. Useful as the arbiter for worker slots inside one process and as
//! the reference against which other backends are tested.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{build_status_report, ensure_live, EngineStore, StoreError, StoreResult};
use crate::models::{Job, JobState, JobStatusReport, Partition, ProgressUpdate};

#[derive(Default)]
struct State {
    jobs: HashMap<String, Job>,
    partitions: HashMap<Uuid, Partition>,
    /// Lease takeovers per job, surfaced in status reports
    takeovers: HashMap<String, u64>,
}

/// Reference [`EngineStore`] backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned mutex means a panic mid-operation; the state cannot be
        // trusted either way, so propagate the panic.
        self.state.lock().expect("memory store mutex poisoned")
    }
}

#[async_trait]
impl EngineStore for MemoryStore {
    async fn count_jobs(&self, cancel: &CancellationToken) -> StoreResult<u64> {
        ensure_live(cancel)?;
        Ok(self.lock().jobs.len() as u64)
    }

    async fn insert_job(&self, job: Job, cancel: &CancellationToken) -> StoreResult<()> {
        ensure_live(cancel)?;
        let mut state = self.lock();
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::duplicate(&job.id));
        }
        state.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn update_job_state(
        &self,
        id: &str,
        timestamp: DateTime<Utc>,
        new_state: JobState,
        error: Option<String>,
        cancel: &CancellationToken,
    ) -> StoreResult<Job> {
        ensure_live(cancel)?;
        let mut state = self.lock();
        let job = state.jobs.get(id).ok_or_else(|| StoreError::unknown(id))?;
        if job.state == new_state {
            return Ok(job.clone());
        }
        if !job.state.can_transition_to(new_state) {
            return Err(StoreError::InvalidTransition {
                from: job.state,
                to: new_state,
            });
        }
        let updated = job.with_state(timestamp, new_state, error);
        state.jobs.insert(id.to_string(), updated.clone());
        Ok(updated)
    }

    async fn retrieve_job(&self, id: &str, cancel: &CancellationToken) -> StoreResult<Job> {
        ensure_live(cancel)?;
        self.lock()
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::unknown(id))
    }

    async fn insert_partition(
        &self,
        partition: Partition,
        cancel: &CancellationToken,
    ) -> StoreResult<()> {
        ensure_live(cancel)?;
        let mut state = self.lock();
        if !state.jobs.contains_key(&partition.job_id) {
            return Err(StoreError::InvalidReference(partition.job_id.clone()));
        }
        if state.partitions.contains_key(&partition.id) {
            return Err(StoreError::duplicate(partition.id));
        }
        state.partitions.insert(partition.id, partition);
        Ok(())
    }

    async fn retrieve_partition(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> StoreResult<Partition> {
        ensure_live(cancel)?;
        self.lock()
            .partitions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::unknown(id))
    }

    async fn try_acquire_partition(
        &self,
        job_id: &str,
        requester: &str,
        now: DateTime<Utc>,
        active_cutoff: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> StoreResult<Option<Partition>> {
        ensure_live(cancel)?;
        let mut state = self.lock();
        if !state.jobs.contains_key(job_id) {
            return Err(StoreError::unknown(job_id));
        }

        let candidate = state
            .partitions
            .values()
            .filter(|p| p.job_id == job_id && p.is_acquirable(active_cutoff))
            .max_by(|a, b| {
                a.remaining
                    .cmp(&b.remaining)
                    // Deterministic tie-break: prefer the smaller id
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|p| p.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let previous = state.partitions.get(&id).cloned().expect("candidate exists");
        if previous.owner.is_some() {
            *state.takeovers.entry(job_id.to_string()).or_default() += 1;
        }
        let leased = previous.with_lease(requester, now);
        state.partitions.insert(id, leased.clone());
        Ok(Some(leased))
    }

    async fn try_request_split(
        &self,
        job_id: &str,
        active_cutoff: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> StoreResult<bool> {
        ensure_live(cancel)?;
        let mut state = self.lock();
        if !state.jobs.contains_key(job_id) {
            return Err(StoreError::unknown(job_id));
        }

        let candidate = state
            .partitions
            .values()
            .filter(|p| {
                p.job_id == job_id
                    && p.owner.is_some()
                    && p.updated >= active_cutoff
                    && !p.is_completed
                    && !p.is_split_requested
            })
            .max_by(|a, b| {
                a.remaining
                    .cmp(&b.remaining)
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|p| p.id);

        let Some(id) = candidate else {
            return Ok(false);
        };

        if let Some(p) = state.partitions.get_mut(&id) {
            p.is_split_requested = true;
        }
        Ok(true)
    }

    async fn report_progress(
        &self,
        id: Uuid,
        owner: &str,
        now: DateTime<Utc>,
        update: ProgressUpdate,
        cancel: &CancellationToken,
    ) -> StoreResult<Partition> {
        ensure_live(cancel)?;
        let mut state = self.lock();
        let stored = state
            .partitions
            .get(&id)
            .ok_or_else(|| StoreError::unknown(id))?;

        if stored.owner.as_deref() != Some(owner) {
            return Err(StoreError::Lock {
                id,
                requester: owner.to_string(),
                holder: stored.owner.clone(),
            });
        }
        if stored.is_completed {
            return Ok(stored.clone());
        }

        let updated = stored.with_progress(&update, now);
        state.partitions.insert(id, updated.clone());
        Ok(updated)
    }

    async fn insert_split_partition(
        &self,
        update: Partition,
        insert: Partition,
        cancel: &CancellationToken,
    ) -> StoreResult<()> {
        ensure_live(cancel)?;
        let mut state = self.lock();

        let stored = state
            .partitions
            .get(&update.id)
            .ok_or_else(|| StoreError::unknown(update.id))?;
        if stored.owner != update.owner {
            return Err(StoreError::Lock {
                id: update.id,
                requester: update.owner.clone().unwrap_or_default(),
                holder: stored.owner.clone(),
            });
        }
        if state.partitions.contains_key(&insert.id) {
            return Err(StoreError::duplicate(insert.id));
        }
        if !state.jobs.contains_key(&insert.job_id) {
            return Err(StoreError::InvalidReference(insert.job_id.clone()));
        }

        // Single critical section: both writes land together or the method
        // returned above with nothing written.
        state.partitions.insert(update.id, update);
        state.partitions.insert(insert.id, insert);
        Ok(())
    }

    async fn count_incomplete_partitions(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<u64> {
        ensure_live(cancel)?;
        let state = self.lock();
        if !state.jobs.contains_key(job_id) {
            return Err(StoreError::unknown(job_id));
        }
        Ok(state
            .partitions
            .values()
            .filter(|p| p.job_id == job_id && !p.is_completed)
            .count() as u64)
    }

    async fn retrieve_job_status_report(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> StoreResult<JobStatusReport> {
        ensure_live(cancel)?;
        let state = self.lock();
        let job = state
            .jobs
            .get(job_id)
            .ok_or_else(|| StoreError::unknown(job_id))?;
        let takeovers = state.takeovers.get(job_id).copied().unwrap_or(0);
        Ok(build_status_report(
            job,
            state.partitions.values().filter(|p| p.job_id == job_id),
            takeovers,
            now,
        ))
    }
}
