//! Observational event sink
//!
//! Fire-and-forget notifications about engine activity. Sinks never affect
//! protocol correctness: emitting is synchronous, infallible and cheap, and
//! implementations must not block.

use std::time::Duration;

use uuid::Uuid;

use crate::engine::EngineState;

/// Something observable the engine or scheduler did.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A worker slot moved through its state machine
    StateChanged { worker: String, state: EngineState },

    /// A lease was acquired
    LeaseAcquired {
        worker: String,
        job_id: String,
        partition_id: Uuid,
        duration: Duration,
    },

    /// An acquisition attempt found no candidate partition
    LeaseUnavailable { worker: String, job_id: String },

    /// A mutating call failed because the lease was taken over
    LeaseLost {
        worker: String,
        job_id: String,
        partition_id: Uuid,
    },

    /// A batch was fetched from the data source
    BatchRetrieved {
        worker: String,
        job_id: String,
        partition_id: Uuid,
        count: usize,
        duration: Duration,
    },

    /// A batch was handed to the batch processor
    BatchProcessed {
        worker: String,
        job_id: String,
        partition_id: Uuid,
        count: usize,
        success: bool,
        duration: Duration,
    },

    /// A progress report was accepted by the store
    ProgressReported {
        worker: String,
        job_id: String,
        partition_id: Uuid,
        processed: u64,
        remaining: u64,
        duration: Duration,
    },

    /// A new partition appeared (job bootstrap or split)
    PartitionCreated { job_id: String, partition_id: Uuid },

    /// A partition was exhausted
    PartitionCompleted {
        worker: String,
        job_id: String,
        partition_id: Uuid,
    },

    /// A split committed: the owner kept the head, the tail is free
    PartitionSplit {
        worker: String,
        job_id: String,
        partition_id: Uuid,
        new_partition_id: Uuid,
        duration: Duration,
    },

    /// A split request arrived on a range too narrow to split
    SplitDeclined {
        worker: String,
        job_id: String,
        partition_id: Uuid,
    },
}

/// Receiver of [`EngineEvent`] notifications.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Sink that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// Sink that forwards events to `tracing` as structured records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: EngineEvent) {
        match event {
            EngineEvent::StateChanged { worker, state } => {
                tracing::debug!(worker = %worker, state = %state, "engine state changed");
            }
            EngineEvent::LeaseAcquired {
                worker,
                job_id,
                partition_id,
                duration,
            } => {
                tracing::info!(
                    worker = %worker,
                    job = %job_id,
                    partition = %partition_id,
                    duration_ms = duration.as_millis() as u64,
                    "lease acquired"
                );
            }
            EngineEvent::LeaseUnavailable { worker, job_id } => {
                tracing::debug!(worker = %worker, job = %job_id, "no acquirable partition");
            }
            EngineEvent::LeaseLost {
                worker,
                job_id,
                partition_id,
            } => {
                tracing::warn!(
                    worker = %worker,
                    job = %job_id,
                    partition = %partition_id,
                    "lease lost to another worker"
                );
            }
            EngineEvent::BatchRetrieved {
                worker,
                partition_id,
                count,
                duration,
                ..
            } => {
                tracing::debug!(
                    worker = %worker,
                    partition = %partition_id,
                    count = count,
                    duration_ms = duration.as_millis() as u64,
                    "batch retrieved"
                );
            }
            EngineEvent::BatchProcessed {
                worker,
                partition_id,
                count,
                success,
                duration,
                ..
            } => {
                tracing::debug!(
                    worker = %worker,
                    partition = %partition_id,
                    count = count,
                    success = success,
                    duration_ms = duration.as_millis() as u64,
                    "batch processed"
                );
            }
            EngineEvent::ProgressReported {
                worker,
                partition_id,
                processed,
                remaining,
                ..
            } => {
                tracing::debug!(
                    worker = %worker,
                    partition = %partition_id,
                    processed = processed,
                    remaining = remaining,
                    "progress reported"
                );
            }
            EngineEvent::PartitionCreated {
                job_id,
                partition_id,
            } => {
                tracing::info!(job = %job_id, partition = %partition_id, "partition created");
            }
            EngineEvent::PartitionCompleted {
                worker,
                job_id,
                partition_id,
            } => {
                tracing::info!(
                    worker = %worker,
                    job = %job_id,
                    partition = %partition_id,
                    "partition completed"
                );
            }
            EngineEvent::PartitionSplit {
                worker,
                partition_id,
                new_partition_id,
                duration,
                ..
            } => {
                tracing::info!(
                    worker = %worker,
                    partition = %partition_id,
                    new_partition = %new_partition_id,
                    duration_ms = duration.as_millis() as u64,
                    "partition split"
                );
            }
            EngineEvent::SplitDeclined {
                worker,
                partition_id,
                ..
            } => {
                tracing::debug!(
                    worker = %worker,
                    partition = %partition_id,
                    "split declined, range too narrow"
                );
            }
        }
    }
}
