// Core data structures for the rangeflow engine

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A contiguous span of an ordered key space.
///
/// Represents `[first, last]` when `is_inclusive` is true, `[first, last)`
/// otherwise. Direction (ascending or descending key order) is a property of
/// the data source serving the range, not of the range itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range<K> {
    pub first: K,
    pub last: K,
    pub is_inclusive: bool,
}

impl<K> Range<K> {
    /// Create a range covering `[first, last]`.
    pub fn inclusive(first: K, last: K) -> Self {
        Self {
            first,
            last,
            is_inclusive: true,
        }
    }

    /// Create a range covering `[first, last)`.
    pub fn exclusive(first: K, last: K) -> Self {
        Self {
            first,
            last,
            is_inclusive: false,
        }
    }

    /// Map both bounds through `f`, preserving inclusivity.
    pub fn map<U, F: FnMut(&K) -> U>(&self, mut f: F) -> Range<U> {
        Range {
            first: f(&self.first),
            last: f(&self.last),
            is_inclusive: self.is_inclusive,
        }
    }
}

/// Lifecycle state of a [`Job`].
///
/// States only move forward along the listed order; `Failed` is reachable
/// from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Initializing,
    Ready,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Create from string representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initializing" => Some(Self::Initializing),
            "ready" => Some(Self::Ready),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn order(&self) -> u8 {
        match self {
            Self::Initializing => 0,
            Self::Ready => 1,
            Self::Processing => 2,
            Self::Completed => 3,
            Self::Failed => 4,
        }
    }

    /// Check whether a transition to `next` is allowed.
    ///
    /// Forward moves along the listed order are allowed; `Failed` is allowed
    /// from any non-terminal state; everything else is rejected.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobState::Failed => true,
            _ => next.order() > self.order(),
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One logical distributed processing run over an entire key space.
///
/// Jobs are created by the scheduler and mutated only through the named
/// state-transition operations on the store, never by raw field updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique, externally chosen identifier
    pub id: String,

    /// When the job was inserted
    pub created: DateTime<Utc>,

    /// Last state change
    pub updated: DateTime<Utc>,

    /// When processing began (first partition acquisition)
    pub started: Option<DateTime<Utc>>,

    /// When the job reached a terminal state
    pub completed: Option<DateTime<Utc>>,

    /// Current lifecycle state
    pub state: JobState,

    /// Failure detail when `state` is `Failed`
    pub error: Option<String>,

    /// Maximum items fetched and processed per batch
    pub batch_size: usize,

    /// Upper bound on the time a worker may spend on one batch, in seconds.
    /// Together with `clock_drift_secs` this bounds lease validity.
    pub batch_timeout_secs: i64,

    /// Tolerance for unsynchronized clocks between workers and the store,
    /// in seconds
    pub clock_drift_secs: i64,
}

impl Job {
    /// Create a new job in the `Initializing` state.
    pub fn new(
        id: impl Into<String>,
        now: DateTime<Utc>,
        batch_size: usize,
        batch_timeout_secs: i64,
        clock_drift_secs: i64,
    ) -> Self {
        Self {
            id: id.into(),
            created: now,
            updated: now,
            started: None,
            completed: None,
            state: JobState::Initializing,
            error: None,
            batch_size,
            batch_timeout_secs,
            clock_drift_secs,
        }
    }

    /// Copy with a new state applied at `timestamp`.
    ///
    /// Sets `started` on entering `Processing` and `completed` on reaching a
    /// terminal state. Validity of the transition is checked by the store,
    /// not here.
    pub fn with_state(
        &self,
        timestamp: DateTime<Utc>,
        state: JobState,
        error: Option<String>,
    ) -> Self {
        let mut job = self.clone();
        job.state = state;
        job.updated = timestamp;
        job.error = error;
        if state == JobState::Processing && job.started.is_none() {
            job.started = Some(timestamp);
        }
        if state.is_terminal() && job.completed.is_none() {
            job.completed = Some(timestamp);
        }
        job
    }

    /// Lease validity window: `batch_timeout + clock_drift`.
    pub fn lease_timeout(&self) -> Duration {
        Duration::seconds(self.batch_timeout_secs + self.clock_drift_secs)
    }

    /// Timestamp before which a held lease counts as abandoned.
    pub fn active_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.lease_timeout()
    }
}

/// A contiguous key sub-range of a [`Job`] with its own lease and progress.
///
/// Key bounds and the resume position are held in serialized form so the
/// store stays agnostic of the key type; the processing engine decodes them
/// through its [`crate::keyspace::KeySpace`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    /// System-generated identifier
    pub id: Uuid,

    /// Owning job; must exist in the store
    pub job_id: String,

    /// Worker currently holding the lease; `None` means free
    pub owner: Option<String>,

    /// When the partition was inserted
    pub created: DateTime<Utc>,

    /// Last heartbeat from the owner; staleness beyond the job's lease
    /// timeout makes the lease eligible for takeover
    pub updated: DateTime<Utc>,

    /// Key bounds, serialized
    pub range: Range<String>,

    /// Last key actually processed, serialized; `None` until the first batch
    pub position: Option<String>,

    /// Items processed so far
    pub processed: u64,

    /// Estimated items left
    pub remaining: u64,

    /// Whether all keys in the range have been processed. Completed
    /// partitions are immutable except for read access.
    pub is_completed: bool,

    /// Advisory items/sec from the owner's last batch
    pub throughput: f64,

    /// Whether the current owner should detach its unprocessed tail
    pub is_split_requested: bool,
}

impl Partition {
    /// Create a new free partition over `range` with a fresh id.
    pub fn new(
        job_id: impl Into<String>,
        range: Range<String>,
        remaining: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job_id.into(),
            owner: None,
            created: now,
            updated: now,
            range,
            position: None,
            processed: 0,
            remaining,
            is_completed: false,
            throughput: 0.0,
            is_split_requested: false,
        }
    }

    /// Copy with the lease assigned to `requester` at `now`.
    ///
    /// Clears any pending split request: the request targeted the previous
    /// owner's position and must be re-issued against the new lease.
    pub fn with_lease(&self, requester: &str, now: DateTime<Utc>) -> Self {
        let mut p = self.clone();
        p.owner = Some(requester.to_string());
        p.updated = now;
        p.is_split_requested = false;
        p
    }

    /// Copy with a progress report applied at `now`.
    pub fn with_progress(&self, update: &ProgressUpdate, now: DateTime<Utc>) -> Self {
        let mut p = self.clone();
        p.updated = now;
        if update.position.is_some() {
            p.position = update.position.clone();
        }
        p.processed = update.processed;
        p.remaining = update.remaining;
        p.is_completed = update.completed;
        p.throughput = update.throughput;
        p
    }

    /// Copy shrunk to `[first, split_key)` for the owner's side of a split.
    ///
    /// The detached tail `[split_key, last]` becomes a separate partition via
    /// [`Partition::split_remainder`].
    pub fn with_shrunk_range(
        &self,
        split_key: String,
        remaining: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let mut p = self.clone();
        p.range.last = split_key;
        p.range.is_inclusive = false;
        p.remaining = remaining;
        p.is_split_requested = false;
        p.updated = now;
        p
    }

    /// New free partition covering the detached tail `[split_key, last]`
    /// (inclusivity of `last` carried over from the original range).
    pub fn split_remainder(&self, split_key: String, remaining: u64, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: self.job_id.clone(),
            owner: None,
            created: now,
            updated: now,
            range: Range {
                first: split_key,
                last: self.range.last.clone(),
                is_inclusive: self.range.is_inclusive,
            },
            position: None,
            processed: 0,
            remaining,
            is_completed: false,
            throughput: 0.0,
            is_split_requested: false,
        }
    }

    /// Whether the lease is free or stale relative to `active_cutoff`.
    pub fn is_acquirable(&self, active_cutoff: DateTime<Utc>) -> bool {
        !self.is_completed && (self.owner.is_none() || self.updated < active_cutoff)
    }
}

/// One progress report from the owner of a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Last key processed, serialized; `None` when no batch completed yet
    pub position: Option<String>,

    /// Total items processed on this partition
    pub processed: u64,

    /// Estimated items left
    pub remaining: u64,

    /// Whether the partition is exhausted
    pub completed: bool,

    /// Items/sec over the last batch
    pub throughput: f64,
}

impl ProgressUpdate {
    /// Report marking the partition exhausted.
    pub fn completed(position: Option<String>, processed: u64) -> Self {
        Self {
            position,
            processed,
            remaining: 0,
            completed: true,
            throughput: 0.0,
        }
    }
}

/// Aggregated view of a job and its partitions at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: String,
    pub state: JobState,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,

    /// Free partitions nobody has touched yet
    pub partitions_untouched: u64,

    /// Partitions with a live lease
    pub partitions_in_progress: u64,

    /// Exhausted partitions
    pub partitions_completed: u64,

    /// Items processed across all partitions
    pub keys_completed: u64,

    /// Estimated items left across all partitions
    pub keys_remaining: u64,

    /// Sum of advisory throughput over partitions with a live lease
    pub throughput: f64,

    /// Split requests not yet honored
    pub pending_splits: u64,

    /// Times a lease was taken over from a stale owner
    pub lease_takeovers: u64,

    /// Most recent partition heartbeat
    pub last_activity: Option<DateTime<Utc>>,
}
