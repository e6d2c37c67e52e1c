//! Worker slot state machine

use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::split::{execute_split, SplitOutcome, SplitRequest};
use super::{EngineState, PartitionFailurePolicy, ProcessingEngine};
use crate::error::Result;
use crate::events::EngineEvent;
use crate::keyspace::KeySpace;
use crate::metrics;
use crate::models::{Job, JobState, Partition, ProgressUpdate, Range};
use crate::source::{BatchProcessor, DataSource, ProcessError, SourceError};
use crate::store::StoreError;
use crate::utils::with_retry_if;

impl<K, D, P> ProcessingEngine<K, D, P>
where
    K: KeySpace,
    D: DataSource<Key = K::Key>,
    P: BatchProcessor<Item = D::Item>,
    D::Item: Clone,
{
    /// Run this worker slot against `job_id` until the job reaches a
    /// terminal state or `cancel` fires.
    ///
    /// The slot alternates between acquiring a lease and working through
    /// the leased partition batch by batch. Everything the slot learns
    /// about the outside world arrives through the store, so any number of
    /// slots, in this process or others, can run the same job concurrently.
    pub async fn run(&self, job_id: &str, cancel: &CancellationToken) -> Result<()> {
        self.set_state(EngineState::Ready);
        metrics::worker_started(job_id);
        let result = self.run_loop(job_id, cancel).await;
        metrics::worker_stopped(job_id);
        self.set_state(EngineState::Stopped);
        result
    }

    fn set_state(&self, state: EngineState) {
        self.sink.emit(EngineEvent::StateChanged {
            worker: self.config.worker_id.clone(),
            state,
        });
    }

    async fn run_loop(&self, job_id: &str, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let job = with_retry_if(
                &self.config.retry,
                || self.store.retrieve_job(job_id, cancel),
                StoreError::is_transient,
            )
            .await?;
            if job.state.is_terminal() {
                info!(job = %job_id, state = %job.state, "job reached terminal state, stopping");
                return Ok(());
            }

            let now = Utc::now();
            let acquire_started = Instant::now();
            let acquired = with_retry_if(
                &self.config.retry,
                || {
                    self.store.try_acquire_partition(
                        job_id,
                        &self.config.worker_id,
                        now,
                        job.active_cutoff(now),
                        cancel,
                    )
                },
                StoreError::is_transient,
            )
            .await?;

            let Some(partition) = acquired else {
                self.sink.emit(EngineEvent::LeaseUnavailable {
                    worker: self.config.worker_id.clone(),
                    job_id: job_id.to_string(),
                });
                self.idle(cancel).await;
                continue;
            };

            self.sink.emit(EngineEvent::LeaseAcquired {
                worker: self.config.worker_id.clone(),
                job_id: job_id.to_string(),
                partition_id: partition.id,
                duration: acquire_started.elapsed(),
            });
            metrics::record_lease_acquired(job_id);

            // The first acquisition for a job moves it Ready -> Processing;
            // racing workers are fine because same-state updates are
            // idempotent and a job completed in between rejects cleanly.
            if job.state == JobState::Ready {
                match self.store.mark_started(job_id, Utc::now(), cancel).await {
                    Ok(_) | Err(StoreError::InvalidTransition { .. }) => {}
                    Err(e) if e.is_transient() => {
                        warn!(job = %job_id, error = %e, "could not mark job started, continuing")
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            self.set_state(EngineState::Processing);
            let outcome = self.process_partition(&job, partition, cancel).await;
            self.set_state(EngineState::Ready);

            if let Err(e) = outcome {
                match self.config.failure_policy {
                    PartitionFailurePolicy::AbandonPartition => {
                        warn!(
                            job = %job_id,
                            worker = %self.config.worker_id,
                            error = %e,
                            "abandoning partition after unrecoverable error"
                        );
                    }
                    PartitionFailurePolicy::FailJob => {
                        match self
                            .store
                            .mark_failed(job_id, Utc::now(), e.to_string(), cancel)
                            .await
                        {
                            Ok(_) | Err(StoreError::InvalidTransition { .. }) => {}
                            Err(mark_err) => {
                                warn!(job = %job_id, error = %mark_err, "could not mark job failed")
                            }
                        }
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Wait one polling interval, jittered so idle slots do not stampede
    /// the store in lockstep.
    async fn idle(&self, cancel: &CancellationToken) {
        let base = self.config.poll_interval;
        let jitter = rand::thread_rng().gen_range(0..=(base.as_millis() as u64 / 5).max(1));
        let wait = base + Duration::from_millis(jitter);
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    /// Work through one leased partition until it is exhausted, the lease
    /// is lost, cancellation fires, or a non-transient error aborts the
    /// attempt.
    async fn process_partition(
        &self,
        job: &Job,
        partition: Partition,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let job_id = job.id.as_str();
        let worker = self.config.worker_id.clone();

        let first: K::Key = self.keys.deserialize(&partition.range.first)?;
        let mut last: K::Key = self.keys.deserialize(&partition.range.last)?;
        let mut is_inclusive = partition.range.is_inclusive;
        let mut position: Option<K::Key> = partition
            .position
            .as_deref()
            .map(|raw| self.keys.deserialize(raw))
            .transpose()?;
        let mut processed = partition.processed;
        let mut remaining = partition.remaining;
        // Once the span proves too narrow it can never become splittable
        // again, so the request is dropped for the rest of this lease.
        let mut split_declined = false;

        loop {
            if cancel.is_cancelled() {
                // Leave the lease to expire; takeover picks up from the
                // last reported position.
                return Ok(());
            }

            let cycle_started = Instant::now();
            let fetch_range = Range {
                first: position.clone().unwrap_or_else(|| first.clone()),
                last: last.clone(),
                is_inclusive,
            };
            // The position key itself is already processed
            let skip = u64::from(position.is_some());

            let fetch_started = Instant::now();
            let batch = with_retry_if(
                &self.config.retry,
                || self.source.next_batch(&fetch_range, skip, job.batch_size, cancel),
                SourceError::is_transient,
            )
            .await?;
            self.sink.emit(EngineEvent::BatchRetrieved {
                worker: worker.clone(),
                job_id: job_id.to_string(),
                partition_id: partition.id,
                count: batch.len(),
                duration: fetch_started.elapsed(),
            });
            metrics::record_batch_retrieved(job_id, batch.len());

            if batch.is_empty() {
                return self
                    .complete_partition(job, &partition, position.as_ref(), processed, cancel)
                    .await;
            }

            let (batch_keys, items): (Vec<K::Key>, Vec<D::Item>) = batch.into_iter().unzip();
            let last_key = batch_keys.last().expect("non-empty batch").clone();
            let count = batch_keys.len() as u64;

            let process_started = Instant::now();
            let process_result = with_retry_if(
                &self.config.retry,
                || {
                    let items = items.clone();
                    async move { self.processor.process(items, cancel).await }
                },
                ProcessError::is_transient,
            )
            .await;
            let process_elapsed = process_started.elapsed();

            if let Err(e) = process_result {
                self.sink.emit(EngineEvent::BatchProcessed {
                    worker: worker.clone(),
                    job_id: job_id.to_string(),
                    partition_id: partition.id,
                    count: count as usize,
                    success: false,
                    duration: process_elapsed,
                });
                metrics::record_batch_processed(job_id, false, process_elapsed.as_secs_f64());
                return Err(e.into());
            }
            self.sink.emit(EngineEvent::BatchProcessed {
                worker: worker.clone(),
                job_id: job_id.to_string(),
                partition_id: partition.id,
                count: count as usize,
                success: true,
                duration: process_elapsed,
            });
            metrics::record_batch_processed(job_id, true, process_elapsed.as_secs_f64());

            position = Some(last_key);
            processed += count;
            remaining = remaining.saturating_sub(count);
            let cycle_secs = cycle_started.elapsed().as_secs_f64();
            let throughput = if cycle_secs > 0.0 {
                count as f64 / cycle_secs
            } else {
                count as f64
            };

            let update = ProgressUpdate {
                position: position.as_ref().map(|k| self.keys.serialize(k)),
                processed,
                remaining,
                completed: false,
                throughput,
            };
            let report_started = Instant::now();
            let reported = match with_retry_if(
                &self.config.retry,
                || {
                    self.store.report_progress(
                        partition.id,
                        &worker,
                        Utc::now(),
                        update.clone(),
                        cancel,
                    )
                },
                StoreError::is_transient,
            )
            .await
            {
                Ok(p) => p,
                Err(StoreError::Lock { .. }) => {
                    self.emit_lease_lost(job_id, partition.id);
                    metrics::record_progress_report(job_id, false);
                    return Ok(());
                }
                Err(e) => {
                    metrics::record_progress_report(job_id, false);
                    return Err(e.into());
                }
            };
            metrics::record_progress_report(job_id, true);
            self.sink.emit(EngineEvent::ProgressReported {
                worker: worker.clone(),
                job_id: job_id.to_string(),
                partition_id: partition.id,
                processed,
                remaining,
                duration: report_started.elapsed(),
            });

            if reported.is_split_requested && !split_declined {
                let split_started = Instant::now();
                let outcome = execute_split(
                    self.store.as_ref(),
                    self.keys.as_ref(),
                    self.source.as_ref(),
                    self.config.split_estimate,
                    SplitRequest {
                        partition: &reported,
                        position: position.as_ref(),
                        first: &first,
                        last: &last,
                        is_inclusive,
                        remaining,
                    },
                    Utc::now(),
                    cancel,
                )
                .await?;

                match outcome {
                    SplitOutcome::Committed { update, insert } => {
                        last = self.keys.deserialize(&update.range.last)?;
                        is_inclusive = update.range.is_inclusive;
                        remaining = update.remaining;
                        self.sink.emit(EngineEvent::PartitionSplit {
                            worker: worker.clone(),
                            job_id: job_id.to_string(),
                            partition_id: partition.id,
                            new_partition_id: insert.id,
                            duration: split_started.elapsed(),
                        });
                        self.sink.emit(EngineEvent::PartitionCreated {
                            job_id: job_id.to_string(),
                            partition_id: insert.id,
                        });
                        metrics::record_partition_split(job_id);
                    }
                    SplitOutcome::NotSplittable => {
                        split_declined = true;
                        self.sink.emit(EngineEvent::SplitDeclined {
                            worker: worker.clone(),
                            job_id: job_id.to_string(),
                            partition_id: partition.id,
                        });
                        metrics::record_split_declined(job_id);
                    }
                    SplitOutcome::LeaseLost => {
                        self.emit_lease_lost(job_id, partition.id);
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Report the partition exhausted, then complete the job when it was
    /// the last one.
    async fn complete_partition(
        &self,
        job: &Job,
        partition: &Partition,
        position: Option<&K::Key>,
        processed: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let job_id = job.id.as_str();
        let update =
            ProgressUpdate::completed(position.map(|k| self.keys.serialize(k)), processed);

        match with_retry_if(
            &self.config.retry,
            || {
                self.store.report_progress(
                    partition.id,
                    &self.config.worker_id,
                    Utc::now(),
                    update.clone(),
                    cancel,
                )
            },
            StoreError::is_transient,
        )
        .await
        {
            Ok(_) => {}
            Err(StoreError::Lock { .. }) => {
                self.emit_lease_lost(job_id, partition.id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        self.sink.emit(EngineEvent::PartitionCompleted {
            worker: self.config.worker_id.clone(),
            job_id: job_id.to_string(),
            partition_id: partition.id,
        });
        metrics::record_partition_completed(job_id);
        info!(
            worker = %self.config.worker_id,
            job = %job_id,
            partition = %partition.id,
            processed = processed,
            "partition completed"
        );

        let incomplete = with_retry_if(
            &self.config.retry,
            || self.store.count_incomplete_partitions(job_id, cancel),
            StoreError::is_transient,
        )
        .await?;
        if incomplete == 0 {
            // Two workers can race to finish the last two partitions; the
            // second completion call is idempotent and a concurrent failure
            // transition rejects cleanly.
            match with_retry_if(
                &self.config.retry,
                || self.store.mark_completed(job_id, Utc::now(), cancel),
                StoreError::is_transient,
            )
            .await
            {
                Ok(_) => info!(job = %job_id, "job completed"),
                Err(StoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn emit_lease_lost(&self, job_id: &str, partition_id: uuid::Uuid) {
        warn!(
            worker = %self.config.worker_id,
            job = %job_id,
            partition = %partition_id,
            "lease lost to another worker, abandoning partition"
        );
        self.sink.emit(EngineEvent::LeaseLost {
            worker: self.config.worker_id.clone(),
            job_id: job_id.to_string(),
            partition_id,
        });
        metrics::record_lease_lost(job_id);
    }
}
