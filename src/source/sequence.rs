//! In-memory integer sequence source
//!
//! Serves a dense range of 64-bit integer keys where each item is the key
//! itself. Used by the CLI demo and the integration tests; also a compact
//! reference for how a real source should interpret ranges, direction and
//! pagination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{BatchProcessor, DataSource, ProcessError, SourceError};
use crate::models::Range;

/// Dense integer key space over a fixed range.
#[derive(Debug, Clone)]
pub struct SequenceSource {
    range: Range<i64>,
}

impl SequenceSource {
    /// Source serving `[first, last]` in ascending key order.
    pub fn ascending(first: i64, last: i64) -> Self {
        Self {
            range: Range::inclusive(first, last),
        }
    }

    /// Source serving `[first, last]` in descending key order (`first`
    /// sorts after `last`).
    pub fn descending(first: i64, last: i64) -> Self {
        Self {
            range: Range::inclusive(first, last),
        }
    }

    /// Normalized `(lo, hi)` bounds of `range` with exclusivity applied,
    /// or `None` for an empty range.
    fn bounds(range: &Range<i64>) -> Option<(i64, i64)> {
        let descending = range.first > range.last;
        let (mut lo, mut hi) = if descending {
            (range.last, range.first)
        } else {
            (range.first, range.last)
        };
        if !range.is_inclusive {
            // Exclusivity attaches to `last`, the low bound when descending
            if descending {
                lo = lo.checked_add(1)?;
            } else {
                hi = hi.checked_sub(1)?;
            }
        }
        (lo <= hi).then_some((lo, hi))
    }

    fn count(range: &Range<i64>) -> u64 {
        match Self::bounds(range) {
            Some((lo, hi)) => (hi as i128 - lo as i128 + 1) as u64,
            None => 0,
        }
    }
}

#[async_trait]
impl DataSource for SequenceSource {
    type Key = i64;
    type Item = i64;

    async fn entire_range(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Range<i64>, SourceError> {
        if cancel.is_cancelled() {
            return Err(SourceError::Cancelled);
        }
        Ok(self.range.clone())
    }

    async fn estimate_size(
        &self,
        range: &Range<i64>,
        cancel: &CancellationToken,
    ) -> Result<u64, SourceError> {
        if cancel.is_cancelled() {
            return Err(SourceError::Cancelled);
        }
        Ok(Self::count(range))
    }

    async fn next_batch(
        &self,
        range: &Range<i64>,
        skip: u64,
        take: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<(i64, i64)>, SourceError> {
        if cancel.is_cancelled() {
            return Err(SourceError::Cancelled);
        }
        let Some((lo, hi)) = Self::bounds(range) else {
            return Ok(Vec::new());
        };
        let total = (hi as i128 - lo as i128 + 1) as u64;
        if skip >= total {
            return Ok(Vec::new());
        }

        let take = take.min((total - skip) as usize);
        let descending = range.first > range.last;
        let batch = (0..take as i64)
            .map(|i| {
                let key = if descending {
                    hi - skip as i64 - i
                } else {
                    lo + skip as i64 + i
                };
                (key, key)
            })
            .collect();
        Ok(batch)
    }
}

/// Batch processor that records everything it receives.
///
/// Tolerates overlapping re-delivery by design: items are appended as-is
/// and assertions deduplicate where a test allows takeover overlap.
#[derive(Debug, Default)]
pub struct RecordingProcessor {
    items: Mutex<Vec<i64>>,
    batches: AtomicU64,
}

impl RecordingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total items received across all batches.
    pub fn total(&self) -> u64 {
        self.items.lock().expect("recording processor poisoned").len() as u64
    }

    /// Number of batches received.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }

    /// Snapshot of every item received, in delivery order.
    pub fn snapshot(&self) -> Vec<i64> {
        self.items.lock().expect("recording processor poisoned").clone()
    }
}

#[async_trait]
impl BatchProcessor for RecordingProcessor {
    type Item = i64;

    async fn process(
        &self,
        items: Vec<i64>,
        _cancel: &CancellationToken,
    ) -> Result<(), ProcessError> {
        self.items
            .lock()
            .expect("recording processor poisoned")
            .extend_from_slice(&items);
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
