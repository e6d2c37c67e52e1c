//! Per-node processing engine
//!
//! Each worker slot runs an independent state machine:
//!
//! ```text
//! Ready ──acquire──▶ Processing ──batch loop──▶ Ready │ Stopped
//! ```
//!
//! A slot leases one partition at a time, pulls bounded batches from the
//! external data source, hands them to the external batch processor, and
//! reports progress through the store. Losing the lease (another worker took
//! over after the heartbeat went stale) abandons the partition without
//! crashing the slot. A host process may run many slots concurrently; they
//! share nothing but the store handle.
//!
//! Cancellation is cooperative and checked between batches and between
//! partitions, never inside a single batch-process call, so no partially
//! applied batch goes unreported.

mod split;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::events::EventSink;
use crate::keyspace::KeySpace;
use crate::source::{BatchProcessor, DataSource};
use crate::store::EngineStore;
use crate::utils::RetryConfig;

/// What to do with the job when a partition attempt hits a non-transient
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionFailurePolicy {
    /// Log, abandon the partition (its lease expires and another worker
    /// retries it), keep the job alive
    AbandonPartition,

    /// Mark the whole job `Failed`
    FailJob,
}

impl Default for PartitionFailurePolicy {
    fn default() -> Self {
        Self::AbandonPartition
    }
}

/// How the `remaining` estimate is divided when a partition splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitEstimate {
    /// Split the current estimate proportionally by range width; falls back
    /// to an even split when the key type has no cheap width
    Proportional,

    /// Ask the data source for the size of the detached tail
    Requery,
}

impl Default for SplitEstimate {
    fn default() -> Self {
        Self::Proportional
    }
}

/// Observable state of one worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// Looking for a partition to lease
    Ready,

    /// Holding a lease and working through batches
    Processing,

    /// The job reached a terminal state or cancellation fired
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Processing => write!(f, "processing"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Configuration for one worker slot.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identifier written into leases; must be unique per slot
    pub worker_id: String,

    /// Wait between acquisition attempts when no partition is available
    pub poll_interval: Duration,

    /// Policy for non-transient partition failures
    pub failure_policy: PartitionFailurePolicy,

    /// Policy for remaining-estimates at split time
    pub split_estimate: SplitEstimate,

    /// Retry behavior for transient store and data-source failures
    pub retry: RetryConfig,
}

impl EngineConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            poll_interval: Duration::from_secs(5),
            failure_policy: PartitionFailurePolicy::default(),
            split_estimate: SplitEstimate::default(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_failure_policy(mut self, policy: PartitionFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_split_estimate(mut self, estimate: SplitEstimate) -> Self {
        self.split_estimate = estimate;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// One worker slot bound to a key space, data source and batch processor.
///
/// See [`ProcessingEngine::run`] for the state machine.
pub struct ProcessingEngine<K, D, P>
where
    K: KeySpace,
    D: DataSource<Key = K::Key>,
    P: BatchProcessor<Item = D::Item>,
{
    pub(crate) store: Arc<dyn EngineStore>,
    pub(crate) keys: Arc<K>,
    pub(crate) source: Arc<D>,
    pub(crate) processor: Arc<P>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) config: EngineConfig,
}

impl<K, D, P> ProcessingEngine<K, D, P>
where
    K: KeySpace,
    D: DataSource<Key = K::Key>,
    P: BatchProcessor<Item = D::Item>,
    D::Item: Clone,
{
    pub fn new(
        store: Arc<dyn EngineStore>,
        keys: Arc<K>,
        source: Arc<D>,
        processor: Arc<P>,
        sink: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            keys,
            source,
            processor,
            sink,
            config,
        }
    }
}
