//! External collaborators of the processing engine
//!
//! The engine pulls work from a [`DataSource`] and hands batches to a
//! [`BatchProcessor`]; both live outside the coordination protocol and are
//! injected at construction. No wire format is mandated here.

pub mod sequence;

pub use sequence::{RecordingProcessor, SequenceSource};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::Range;

/// Data source failure
#[derive(Debug, Error)]
pub enum SourceError {
    /// Transient infrastructure failure, safe to retry
    #[error("data source unavailable: {0}")]
    Unavailable(String),

    /// The requested range cannot be served
    #[error("invalid range request: {0}")]
    InvalidRange(String),

    /// The operation's cancellation signal fired
    #[error("data source operation cancelled")]
    Cancelled,

    #[error("data source error: {0}")]
    Other(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Batch processor failure
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Transient downstream failure, safe to retry with the same batch
    #[error("batch processor unavailable: {0}")]
    Unavailable(String),

    /// The batch was rejected; retrying the same input cannot succeed
    #[error("batch rejected: {0}")]
    Rejected(String),
}

impl ProcessError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// An ordered key space with batched, resumable reads.
///
/// Implementations may serve keys ascending or descending; a range whose
/// `first` sorts after its `last` is read in descending order. Pagination
/// must be resumable purely from `(range, skip, take)` so a restarted worker
/// can continue from a persisted position.
#[async_trait]
pub trait DataSource: Send + Sync {
    type Key: Clone + Send + Sync;
    type Item: Send + Sync;

    /// The full key range this source covers.
    async fn entire_range(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Range<Self::Key>, SourceError>;

    /// Estimated number of items in `range`.
    async fn estimate_size(
        &self,
        range: &Range<Self::Key>,
        cancel: &CancellationToken,
    ) -> Result<u64, SourceError>;

    /// Up to `take` key/item pairs from `range`, skipping the first `skip`
    /// in key order. An empty result means the range is exhausted.
    async fn next_batch(
        &self,
        range: &Range<Self::Key>,
        skip: u64,
        take: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<(Self::Key, Self::Item)>, SourceError>;
}

/// Downstream consumer of processed batches.
///
/// Delivery is at-least-once: after a worker crash and lease takeover the
/// tail of the last reported batch may be re-delivered, so implementations
/// must tolerate overlapping input.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    type Item: Send + Sync;

    async fn process(
        &self,
        items: Vec<Self::Item>,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessError>;
}
