//! Partition splitting
//!
//! Run by the current owner after a progress report comes back with
//! `is_split_requested`. The owner's range shrinks to `[first, mid)` and the
//! detached tail `[mid, last]` is inserted as a brand-new free partition in
//! the same store transaction, so the split is invisible to other workers
//! until it is complete. Losing the lease mid-split means another worker
//! already took the partition over; the split is abandoned.

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::SplitEstimate;
use crate::error::Result;
use crate::keyspace::KeySpace;
use crate::models::{Partition, Range};
use crate::source::DataSource;
use crate::store::{EngineStore, StoreError};

/// Result of one split attempt.
pub(crate) enum SplitOutcome {
    /// Both sides committed; `update` is the owner's shrunk partition
    Committed {
        update: Partition,
        insert: Partition,
    },

    /// The unprocessed range holds at most one further key; the request is
    /// dropped locally and the owner keeps processing
    NotSplittable,

    /// The store rejected the commit with a lock failure; the owner must
    /// stop working on this partition
    LeaseLost,
}

/// The owner's current view of the partition being split.
pub(crate) struct SplitRequest<'a, K: KeySpace> {
    pub partition: &'a Partition,
    pub position: Option<&'a K::Key>,
    pub first: &'a K::Key,
    pub last: &'a K::Key,
    pub is_inclusive: bool,
    pub remaining: u64,
}

/// Portion of `remaining` assigned to the detached tail under the
/// proportional policy. Falls back to an even split when the span has no
/// measurable width. The owner's share is computed by subtraction, so the
/// two sides always sum to `remaining` exactly.
fn proportional_share(remaining: u64, tail: Option<u128>, total: Option<u128>) -> u64 {
    match (tail, total) {
        (Some(tail), Some(total)) if total > 0 => {
            let share = remaining as f64 * (tail as f64 / total as f64);
            (share as u64).min(remaining)
        }
        _ => remaining / 2,
    }
}

pub(crate) async fn execute_split<K, D>(
    store: &dyn EngineStore,
    keys: &K,
    source: &D,
    estimate: SplitEstimate,
    req: SplitRequest<'_, K>,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> Result<SplitOutcome>
where
    K: KeySpace,
    D: DataSource<Key = K::Key>,
{
    let from = req.position.unwrap_or(req.first);
    let Some(mid) = keys.split(from, req.last, req.is_inclusive) else {
        return Ok(SplitOutcome::NotSplittable);
    };

    let tail_share = match estimate {
        SplitEstimate::Proportional => proportional_share(
            req.remaining,
            keys.distance(&mid, req.last),
            keys.distance(from, req.last),
        ),
        SplitEstimate::Requery => {
            let tail_range = Range {
                first: mid.clone(),
                last: req.last.clone(),
                is_inclusive: req.is_inclusive,
            };
            match source.estimate_size(&tail_range, cancel).await {
                Ok(size) => size.min(req.remaining),
                Err(e) => {
                    // Estimation is advisory; fall back rather than fail
                    debug!(error = %e, "tail size requery failed, splitting proportionally");
                    proportional_share(
                        req.remaining,
                        keys.distance(&mid, req.last),
                        keys.distance(from, req.last),
                    )
                }
            }
        }
    };
    let owner_share = req.remaining - tail_share;

    let split_key = keys.serialize(&mid);
    let update = req
        .partition
        .with_shrunk_range(split_key.clone(), owner_share, now);
    let insert = req.partition.split_remainder(split_key, tail_share, now);

    match store
        .insert_split_partition(update.clone(), insert.clone(), cancel)
        .await
    {
        Ok(()) => Ok(SplitOutcome::Committed { update, insert }),
        Err(StoreError::Lock { .. }) => Ok(SplitOutcome::LeaseLost),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::Int64Keys;
    use crate::models::Job;
    use crate::source::SequenceSource;
    use crate::store::{EngineStore, MemoryStore};

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[test]
    fn test_proportional_share_conserves() {
        for remaining in [0u64, 1, 999, 1000] {
            let tail = proportional_share(remaining, Some(500), Some(1000));
            assert!(tail <= remaining);
            // owner share computed by subtraction never underflows
            let _ = remaining - tail;
        }
        assert_eq!(proportional_share(1000, Some(500), Some(1000)), 500);
        assert_eq!(proportional_share(1000, Some(250), Some(1000)), 250);
    }

    #[test]
    fn test_proportional_share_without_distance() {
        assert_eq!(proportional_share(1000, None, None), 500);
        assert_eq!(proportional_share(7, None, Some(10)), 3);
    }

    async fn seed_leased_partition(store: &MemoryStore) -> Partition {
        let now = Utc::now();
        store
            .insert_job(Job::new("j1", now, 100, 30, 5), &token())
            .await
            .unwrap();
        let p = Partition::new(
            "j1",
            Range::inclusive("0".to_string(), "999".to_string()),
            1000,
            now,
        );
        store.insert_partition(p.clone(), &token()).await.unwrap();
        store
            .try_acquire_partition("j1", "worker-a", now, now - chrono::Duration::seconds(35), &token())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_split_commits_both_sides() {
        let store = MemoryStore::new();
        let leased = seed_leased_partition(&store).await;
        let source = SequenceSource::ascending(0, 999);
        let keys = Int64Keys;

        let outcome = execute_split(
            &store,
            &keys,
            &source,
            SplitEstimate::Proportional,
            SplitRequest {
                partition: &leased,
                position: Some(&199),
                first: &0,
                last: &999,
                is_inclusive: true,
                remaining: 800,
            },
            Utc::now(),
            &token(),
        )
        .await
        .unwrap();

        let SplitOutcome::Committed { update, insert } = outcome else {
            panic!("expected committed split");
        };
        assert_eq!(update.remaining + insert.remaining, 800);
        assert_eq!(update.range.last, insert.range.first);
        assert!(!update.range.is_inclusive);
        assert!(insert.range.is_inclusive);
        assert!(insert.owner.is_none());
        assert_eq!(insert.processed, 0);

        // Both sides are visible in the store
        let stored_update = store.retrieve_partition(update.id, &token()).await.unwrap();
        let stored_insert = store.retrieve_partition(insert.id, &token()).await.unwrap();
        assert_eq!(stored_update.remaining, update.remaining);
        assert!(!stored_insert.is_split_requested);
    }

    #[tokio::test]
    async fn test_requery_estimate_uses_source_count() {
        let store = MemoryStore::new();
        let leased = seed_leased_partition(&store).await;
        let source = SequenceSource::ascending(0, 999);
        let keys = Int64Keys;

        let outcome = execute_split(
            &store,
            &keys,
            &source,
            SplitEstimate::Requery,
            SplitRequest {
                partition: &leased,
                position: None,
                first: &0,
                last: &999,
                is_inclusive: true,
                remaining: 1000,
            },
            Utc::now(),
            &token(),
        )
        .await
        .unwrap();

        let SplitOutcome::Committed { update, insert } = outcome else {
            panic!("expected committed split");
        };
        // [499, 999] holds exactly 501 keys
        assert_eq!(insert.remaining, 501);
        assert_eq!(update.remaining, 499);
    }

    #[tokio::test]
    async fn test_unsplittable_range_declines() {
        let store = MemoryStore::new();
        let leased = seed_leased_partition(&store).await;
        let source = SequenceSource::ascending(0, 999);
        let keys = Int64Keys;

        let outcome = execute_split(
            &store,
            &keys,
            &source,
            SplitEstimate::Proportional,
            SplitRequest {
                partition: &leased,
                position: Some(&998),
                first: &0,
                last: &999,
                is_inclusive: true,
                remaining: 1,
            },
            Utc::now(),
            &token(),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, SplitOutcome::NotSplittable));
    }

    #[tokio::test]
    async fn test_lost_lease_abandons_split() {
        let store = MemoryStore::new();
        let leased = seed_leased_partition(&store).await;
        let source = SequenceSource::ascending(0, 999);
        let keys = Int64Keys;

        // Another worker takes the partition over before the commit
        let later = Utc::now() + chrono::Duration::seconds(120);
        store
            .try_acquire_partition("j1", "worker-b", later, later - chrono::Duration::seconds(35), &token())
            .await
            .unwrap()
            .unwrap();

        let outcome = execute_split(
            &store,
            &keys,
            &source,
            SplitEstimate::Proportional,
            SplitRequest {
                partition: &leased,
                position: Some(&100),
                first: &0,
                last: &999,
                is_inclusive: true,
                remaining: 899,
            },
            Utc::now(),
            &token(),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, SplitOutcome::LeaseLost));
    }
}
