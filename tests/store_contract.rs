//! Contract tests run against every store backend
//!
//! The in-memory store is the reference; the SQLite backend must behave
//! identically. Each test loops over both.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;

use rangeflow::models::{Job, JobState, Partition, ProgressUpdate, Range};
use rangeflow::storage::SqliteStore;
use rangeflow::store::{EngineStore, MemoryStore, StoreError};

fn token() -> CancellationToken {
    CancellationToken::new()
}

fn backends() -> Vec<(&'static str, Arc<dyn EngineStore>)> {
    vec![
        ("memory", Arc::new(MemoryStore::new())),
        (
            "sqlite",
            Arc::new(SqliteStore::open_in_memory().expect("in-memory sqlite")),
        ),
    ]
}

async fn seed_job(store: &dyn EngineStore, id: &str, timeout_secs: i64) -> Job {
    let job = Job::new(id, Utc::now(), 100, timeout_secs, 5);
    store.insert_job(job.clone(), &token()).await.unwrap();
    job
}

async fn seed_partition(store: &dyn EngineStore, job_id: &str, remaining: u64) -> Partition {
    let p = Partition::new(
        job_id,
        Range::inclusive("0".to_string(), "999".to_string()),
        remaining,
        Utc::now(),
    );
    store.insert_partition(p.clone(), &token()).await.unwrap();
    p
}

#[tokio::test]
async fn duplicate_and_unknown_identifiers() {
    for (name, store) in backends() {
        seed_job(store.as_ref(), "j1", 30).await;

        let err = store
            .insert_job(Job::new("j1", Utc::now(), 10, 30, 5), &token())
            .await
            .unwrap_err();
        assert!(
            matches!(err, StoreError::DuplicateIdentifier(_)),
            "{name}: duplicate job insert"
        );

        let err = store.retrieve_job("missing", &token()).await.unwrap_err();
        assert!(
            matches!(err, StoreError::UnknownIdentifier(_)),
            "{name}: unknown job"
        );

        let err = store
            .try_acquire_partition("missing", "w", Utc::now(), Utc::now(), &token())
            .await
            .unwrap_err();
        assert!(
            matches!(err, StoreError::UnknownIdentifier(_)),
            "{name}: acquire on unknown job"
        );

        let p = Partition::new(
            "missing",
            Range::inclusive("0".to_string(), "9".to_string()),
            10,
            Utc::now(),
        );
        let err = store.insert_partition(p, &token()).await.unwrap_err();
        assert!(
            matches!(err, StoreError::InvalidReference(_)),
            "{name}: partition insert for unknown job"
        );
    }
}

#[tokio::test]
async fn acquisition_selects_largest_remaining() {
    for (name, store) in backends() {
        let job = seed_job(store.as_ref(), "j1", 30).await;
        seed_partition(store.as_ref(), "j1", 10).await;
        let big = seed_partition(store.as_ref(), "j1", 900).await;
        seed_partition(store.as_ref(), "j1", 500).await;

        let now = Utc::now();
        let acquired = store
            .try_acquire_partition("j1", "worker-a", now, job.active_cutoff(now), &token())
            .await
            .unwrap()
            .expect("a candidate exists");
        assert_eq!(acquired.id, big.id, "{name}: largest remaining first");
        assert_eq!(acquired.owner.as_deref(), Some("worker-a"));
        assert!(!acquired.is_split_requested);
    }
}

#[tokio::test]
async fn no_double_lease_under_concurrency() {
    // Eight tasks race for three partitions; every handed-out partition id
    // must be unique while the leases are live.
    for (name, store) in backends() {
        let job = seed_job(store.as_ref(), "j1", 30).await;
        for remaining in [100, 200, 300] {
            seed_partition(store.as_ref(), "j1", remaining).await;
        }

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let cutoff = job.active_cutoff(Utc::now());
            handles.push(tokio::spawn(async move {
                store
                    .try_acquire_partition(
                        "j1",
                        &format!("worker-{i}"),
                        Utc::now(),
                        cutoff,
                        &CancellationToken::new(),
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut acquired_ids = Vec::new();
        for handle in handles {
            if let Some(p) = handle.await.unwrap() {
                acquired_ids.push(p.id);
            }
        }
        assert_eq!(acquired_ids.len(), 3, "{name}: exactly one lease per partition");
        acquired_ids.sort();
        acquired_ids.dedup();
        assert_eq!(acquired_ids.len(), 3, "{name}: no partition leased twice");
    }
}

#[tokio::test]
async fn lock_enforcement_never_mutates() {
    for (name, store) in backends() {
        // Zero lease window: every heartbeat is instantly stale
        let job = seed_job(store.as_ref(), "j1", 0).await;
        let job = store
            .update_job_state("j1", Utc::now(), JobState::Ready, None, &token())
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Ready);
        let p = seed_partition(store.as_ref(), "j1", 1000).await;

        let t0 = Utc::now() - Duration::seconds(10);
        store
            .try_acquire_partition("j1", "worker-a", t0, t0 - Duration::seconds(5), &token())
            .await
            .unwrap()
            .expect("first lease");

        // worker-a stops heartbeating; worker-b takes over
        let now = Utc::now();
        let taken = store
            .try_acquire_partition("j1", "worker-b", now, job.active_cutoff(now), &token())
            .await
            .unwrap()
            .expect("takeover");
        assert_eq!(taken.owner.as_deref(), Some("worker-b"), "{name}");

        // The original owner's next report must fail and change nothing
        let update = ProgressUpdate {
            position: Some("50".to_string()),
            processed: 50,
            remaining: 950,
            completed: false,
            throughput: 10.0,
        };
        let err = store
            .report_progress(p.id, "worker-a", Utc::now(), update, &token())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Lock { .. }), "{name}: lock failure");

        let stored = store.retrieve_partition(p.id, &token()).await.unwrap();
        assert_eq!(stored.owner.as_deref(), Some("worker-b"), "{name}");
        assert_eq!(stored.processed, 0, "{name}: no write after lock");
        assert!(stored.position.is_none(), "{name}");

        let report = store
            .retrieve_job_status_report("j1", Utc::now(), &token())
            .await
            .unwrap();
        assert_eq!(report.lease_takeovers, 1, "{name}");
    }
}

#[tokio::test]
async fn split_commit_is_atomic_and_conserving() {
    for (name, store) in backends() {
        let job = seed_job(store.as_ref(), "j1", 30).await;
        seed_partition(store.as_ref(), "j1", 1000).await;

        let now = Utc::now();
        let leased = store
            .try_acquire_partition("j1", "worker-a", now, job.active_cutoff(now), &token())
            .await
            .unwrap()
            .unwrap();

        let update = leased.with_shrunk_range("500".to_string(), 400, now);
        let insert = leased.split_remainder("500".to_string(), 600, now);
        store
            .insert_split_partition(update.clone(), insert.clone(), &token())
            .await
            .unwrap();

        let stored_update = store.retrieve_partition(update.id, &token()).await.unwrap();
        let stored_insert = store.retrieve_partition(insert.id, &token()).await.unwrap();

        // Conservation of the remaining estimate
        assert_eq!(
            stored_update.remaining + stored_insert.remaining,
            1000,
            "{name}"
        );
        // Gap-free, overlap-free coverage: [0, 500) + [500, 999]
        assert_eq!(stored_update.range.first, "0", "{name}");
        assert_eq!(stored_update.range.last, "500", "{name}");
        assert!(!stored_update.range.is_inclusive, "{name}");
        assert_eq!(stored_insert.range.first, "500", "{name}");
        assert_eq!(stored_insert.range.last, "999", "{name}");
        assert!(stored_insert.range.is_inclusive, "{name}");
        // The tail is free and fresh
        assert!(stored_insert.owner.is_none(), "{name}");
        assert_eq!(stored_insert.processed, 0, "{name}");
        assert!(!stored_update.is_split_requested, "{name}");

        assert_eq!(
            store.count_incomplete_partitions("j1", &token()).await.unwrap(),
            2,
            "{name}"
        );
    }
}

#[tokio::test]
async fn split_commit_fails_whole_when_lease_lost() {
    for (name, store) in backends() {
        let job = seed_job(store.as_ref(), "j1", 0).await;
        seed_partition(store.as_ref(), "j1", 1000).await;

        let t0 = Utc::now() - Duration::seconds(10);
        let leased = store
            .try_acquire_partition("j1", "worker-a", t0, t0 - Duration::seconds(5), &token())
            .await
            .unwrap()
            .unwrap();

        // Takeover happens between the owner's last report and its split
        let now = Utc::now();
        store
            .try_acquire_partition("j1", "worker-b", now, job.active_cutoff(now), &token())
            .await
            .unwrap()
            .unwrap();

        let update = leased.with_shrunk_range("500".to_string(), 400, now);
        let insert = leased.split_remainder("500".to_string(), 600, now);
        let insert_id = insert.id;
        let err = store
            .insert_split_partition(update, insert, &token())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Lock { .. }), "{name}");

        // Neither write landed
        let err = store.retrieve_partition(insert_id, &token()).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownIdentifier(_)), "{name}");
        assert_eq!(
            store.count_incomplete_partitions("j1", &token()).await.unwrap(),
            1,
            "{name}"
        );
    }
}

#[tokio::test]
async fn progress_monotonicity_for_stable_owner() {
    for (name, store) in backends() {
        let job = seed_job(store.as_ref(), "j1", 30).await;
        let p = seed_partition(store.as_ref(), "j1", 1000).await;

        let now = Utc::now();
        store
            .try_acquire_partition("j1", "worker-a", now, job.active_cutoff(now), &token())
            .await
            .unwrap()
            .unwrap();

        let mut last_processed = 0;
        for (position, processed) in [(99i64, 100u64), (199, 200), (299, 300)] {
            let reported = store
                .report_progress(
                    p.id,
                    "worker-a",
                    Utc::now(),
                    ProgressUpdate {
                        position: Some(position.to_string()),
                        processed,
                        remaining: 1000 - processed,
                        completed: false,
                        throughput: 50.0,
                    },
                    &token(),
                )
                .await
                .unwrap();
            assert!(reported.processed > last_processed, "{name}");
            assert_eq!(reported.position.as_deref(), Some(position.to_string().as_str()));
            last_processed = reported.processed;
        }

        let stored = store.retrieve_partition(p.id, &token()).await.unwrap();
        assert_eq!(stored.processed, 300, "{name}");
        assert_eq!(stored.remaining, 700, "{name}");
    }
}

#[tokio::test]
async fn idempotent_job_completion() {
    for (name, store) in backends() {
        seed_job(store.as_ref(), "j1", 30).await;
        let now = Utc::now();
        store.mark_ready("j1", now, &token()).await.unwrap();
        store.mark_started("j1", now, &token()).await.unwrap();

        // Two finishing workers race the completion transition
        let first = store.mark_completed("j1", now, &token()).await.unwrap();
        let second = store.mark_completed("j1", Utc::now(), &token()).await.unwrap();
        assert_eq!(first.state, JobState::Completed, "{name}");
        assert_eq!(second.state, JobState::Completed, "{name}");
        assert_eq!(second.completed, first.completed, "{name}: single completion time");

        // And a late failure attempt cannot un-complete the job
        let err = store
            .mark_failed("j1", Utc::now(), "too late".to_string(), &token())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }), "{name}");
    }
}

#[tokio::test]
async fn split_request_only_targets_live_owners() {
    for (name, store) in backends() {
        let job = seed_job(store.as_ref(), "j1", 30).await;
        seed_partition(store.as_ref(), "j1", 1000).await;

        let now = Utc::now();
        let cutoff = job.active_cutoff(now);
        assert!(
            !store.try_request_split("j1", cutoff, &token()).await.unwrap(),
            "{name}: free partition is not a candidate"
        );

        store
            .try_acquire_partition("j1", "worker-a", now, cutoff, &token())
            .await
            .unwrap()
            .unwrap();
        assert!(
            store.try_request_split("j1", cutoff, &token()).await.unwrap(),
            "{name}: live owner accepts request"
        );
        assert!(
            !store.try_request_split("j1", cutoff, &token()).await.unwrap(),
            "{name}: already flagged"
        );

        let report = store
            .retrieve_job_status_report("j1", now, &token())
            .await
            .unwrap();
        assert_eq!(report.pending_splits, 1, "{name}");
    }
}

#[tokio::test]
async fn sqlite_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("contract.db");

    {
        let store = SqliteStore::open(&path).unwrap();
        seed_job(&store, "j1", 30).await;
        seed_partition(&store, "j1", 1000).await;
        store.mark_ready("j1", Utc::now(), &token()).await.unwrap();
    }

    // A restarted worker process sees the same jobs and partitions
    let store = SqliteStore::open(&path).unwrap();
    let job = store.retrieve_job("j1", &token()).await.unwrap();
    assert_eq!(job.state, JobState::Ready);
    assert_eq!(
        store.count_incomplete_partitions("j1", &token()).await.unwrap(),
        1
    );

    let now = Utc::now();
    let acquired = store
        .try_acquire_partition("j1", "worker-a", now, job.active_cutoff(now), &token())
        .await
        .unwrap();
    assert!(acquired.is_some());
}

#[tokio::test]
async fn acquisition_clears_pending_split_request() {
    for (name, store) in backends() {
        let job = seed_job(store.as_ref(), "j1", 0).await;
        seed_partition(store.as_ref(), "j1", 1000).await;

        let t0 = Utc::now() - Duration::seconds(10);
        store
            .try_acquire_partition("j1", "worker-a", t0, t0 - Duration::seconds(5), &token())
            .await
            .unwrap()
            .unwrap();
        store
            .try_request_split("j1", t0 - Duration::seconds(5), &token())
            .await
            .unwrap();

        // The request targeted worker-a's position; a takeover invalidates it
        let now = Utc::now();
        let taken = store
            .try_acquire_partition("j1", "worker-b", now, job.active_cutoff(now), &token())
            .await
            .unwrap()
            .unwrap();
        assert!(!taken.is_split_requested, "{name}");
    }
}
