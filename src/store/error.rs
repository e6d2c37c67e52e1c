//! Error types for engine data stores

use thiserror::Error;
use uuid::Uuid;

use crate::models::JobState;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Failures of the engine data store contract.
///
/// `DuplicateIdentifier`, `UnknownIdentifier` and `InvalidReference` are
/// caller errors and never retried. `Lock` is expected under concurrent
/// takeover: the caller must abandon its current partition and never retry
/// against the same lease. `Unavailable` marks transient infrastructure
/// trouble and is safe to retry.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Insert collision on a job or partition id
    #[error("duplicate identifier: {0}")]
    DuplicateIdentifier(String),

    /// Reference to a job or partition that does not exist
    #[error("unknown identifier: {0}")]
    UnknownIdentifier(String),

    /// Partition insert referencing a nonexistent job
    #[error("partition references unknown job: {0}")]
    InvalidReference(String),

    /// The stored owner no longer matches the caller: the lease was taken
    /// over. No state was mutated.
    #[error("lease lost on partition {id}: held by {holder:?}, requested by {requester}")]
    Lock {
        id: Uuid,
        requester: String,
        holder: Option<String>,
    },

    /// Job state may only move forward
    #[error("invalid job state transition: {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    /// Transient infrastructure failure (timeout, connection reset)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Non-transient backend driver failure
    #[error("store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The operation's cancellation signal fired before it ran
    #[error("store operation cancelled")]
    Cancelled,
}

impl StoreError {
    /// Whether retrying the same call can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub fn duplicate(id: impl std::fmt::Display) -> Self {
        Self::DuplicateIdentifier(id.to_string())
    }

    pub fn unknown(id: impl std::fmt::Display) -> Self {
        Self::UnknownIdentifier(id.to_string())
    }

    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }
}
