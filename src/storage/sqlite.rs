//! SQLite-backed engine data store
//!
//! Every multi-step operation runs inside an explicit transaction on a
//! single connection, which gives the serializable isolation the store
//! contract requires. Timestamps are persisted as fixed-width RFC 3339
//! strings so lexicographic comparison in SQL matches chronological order.
//!
//! Calls are short and local, so they run synchronously on the async
//! caller's thread rather than through a blocking pool.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::{Job, JobState, JobStatusReport, Partition, ProgressUpdate, Range};
use crate::store::{ensure_live, EngineStore, StoreError, StoreResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id                  TEXT PRIMARY KEY,
    created             TEXT NOT NULL,
    updated             TEXT NOT NULL,
    started             TEXT,
    completed           TEXT,
    state               TEXT NOT NULL,
    error               TEXT,
    batch_size          INTEGER NOT NULL,
    batch_timeout_secs  INTEGER NOT NULL,
    clock_drift_secs    INTEGER NOT NULL,
    lease_takeovers     INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS partitions (
    id                  TEXT PRIMARY KEY,
    job_id              TEXT NOT NULL REFERENCES jobs(id),
    owner               TEXT,
    created             TEXT NOT NULL,
    updated             TEXT NOT NULL,
    first_key           TEXT NOT NULL,
    last_key            TEXT NOT NULL,
    is_inclusive        INTEGER NOT NULL,
    position            TEXT,
    processed           INTEGER NOT NULL,
    remaining           INTEGER NOT NULL,
    is_completed        INTEGER NOT NULL,
    throughput          REAL NOT NULL,
    is_split_requested  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_partitions_job ON partitions(job_id);
"#;

/// [`EngineStore`] persisted in a SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(db_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.deploy_schema()?;
        Ok(store)
    }

    /// Open an in-memory store, mainly for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(db_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.deploy_schema()?;
        Ok(store)
    }

    /// Create the jobs/partitions tables if absent.
    pub fn deploy_schema(&self) -> StoreResult<()> {
        self.lock().execute_batch(SCHEMA).map_err(db_err)
    }

    /// Drop the jobs/partitions tables.
    pub fn remove_schema(&self) -> StoreResult<()> {
        self.lock()
            .execute_batch("DROP TABLE IF EXISTS partitions; DROP TABLE IF EXISTS jobs;")
            .map_err(db_err)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("sqlite connection mutex poisoned")
    }
}

fn db_err(err: rusqlite::Error) -> StoreError {
    use rusqlite::ErrorCode;
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            StoreError::Unavailable(err.to_string())
        }
        _ => StoreError::backend(err),
    }
}

/// Fixed-width RFC 3339 so TEXT comparison equals time comparison.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(StoreError::backend)
}

fn parse_opt_ts(raw: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(&s)).transpose()
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<(Job, u64)> {
    let state_raw: String = row.get("state")?;
    let created: String = row.get("created")?;
    let updated: String = row.get("updated")?;
    let started: Option<String> = row.get("started")?;
    let completed: Option<String> = row.get("completed")?;
    let takeovers: u64 = row.get::<_, i64>("lease_takeovers")? as u64;

    // Map parse failures through a rusqlite error so callers can use the
    // usual row-mapping plumbing; the column index is informational only.
    let bad = |msg: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            msg.to_string().into(),
        )
    };

    let job = Job {
        id: row.get("id")?,
        created: parse_ts(&created).map_err(|_| bad("created"))?,
        updated: parse_ts(&updated).map_err(|_| bad("updated"))?,
        started: parse_opt_ts(started).map_err(|_| bad("started"))?,
        completed: parse_opt_ts(completed).map_err(|_| bad("completed"))?,
        state: JobState::parse(&state_raw).ok_or_else(|| bad("state"))?,
        error: row.get("error")?,
        batch_size: row.get::<_, i64>("batch_size")? as usize,
        batch_timeout_secs: row.get("batch_timeout_secs")?,
        clock_drift_secs: row.get("clock_drift_secs")?,
    };
    Ok((job, takeovers))
}

fn partition_from_row(row: &Row<'_>) -> rusqlite::Result<Partition> {
    let id_raw: String = row.get("id")?;
    let created: String = row.get("created")?;
    let updated: String = row.get("updated")?;

    let bad = |msg: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            msg.to_string().into(),
        )
    };

    Ok(Partition {
        id: Uuid::parse_str(&id_raw).map_err(|_| bad("id"))?,
        job_id: row.get("job_id")?,
        owner: row.get("owner")?,
        created: parse_ts(&created).map_err(|_| bad("created"))?,
        updated: parse_ts(&updated).map_err(|_| bad("updated"))?,
        range: Range {
            first: row.get("first_key")?,
            last: row.get("last_key")?,
            is_inclusive: row.get("is_inclusive")?,
        },
        position: row.get("position")?,
        processed: row.get::<_, i64>("processed")? as u64,
        remaining: row.get::<_, i64>("remaining")? as u64,
        is_completed: row.get("is_completed")?,
        throughput: row.get("throughput")?,
        is_split_requested: row.get("is_split_requested")?,
    })
}

fn insert_partition_row(conn: &Connection, p: &Partition) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO partitions (id, job_id, owner, created, updated, first_key, last_key, \
         is_inclusive, position, processed, remaining, is_completed, throughput, \
         is_split_requested) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            p.id.hyphenated().to_string(),
            p.job_id,
            p.owner,
            ts(p.created),
            ts(p.updated),
            p.range.first,
            p.range.last,
            p.range.is_inclusive,
            p.position,
            p.processed as i64,
            p.remaining as i64,
            p.is_completed,
            p.throughput,
            p.is_split_requested,
        ],
    )?;
    Ok(())
}

fn job_exists(conn: &Connection, id: &str) -> StoreResult<bool> {
    conn.query_row("SELECT 1 FROM jobs WHERE id = ?1", params![id], |_| Ok(()))
        .optional()
        .map(|r| r.is_some())
        .map_err(db_err)
}

fn get_partition(conn: &Connection, id: Uuid) -> StoreResult<Option<Partition>> {
    conn.query_row(
        "SELECT * FROM partitions WHERE id = ?1",
        params![id.hyphenated().to_string()],
        partition_from_row,
    )
    .optional()
    .map_err(db_err)
}

#[async_trait]
impl EngineStore for SqliteStore {
    async fn count_jobs(&self, cancel: &CancellationToken) -> StoreResult<u64> {
        ensure_live(cancel)?;
        self.lock()
            .query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(db_err)
    }

    async fn insert_job(&self, job: Job, cancel: &CancellationToken) -> StoreResult<()> {
        ensure_live(cancel)?;
        let conn = self.lock();
        if job_exists(&conn, &job.id)? {
            return Err(StoreError::duplicate(&job.id));
        }
        conn.execute(
            "INSERT INTO jobs (id, created, updated, started, completed, state, error, \
             batch_size, batch_timeout_secs, clock_drift_secs, lease_takeovers) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0)",
            params![
                job.id,
                ts(job.created),
                ts(job.updated),
                job.started.map(ts),
                job.completed.map(ts),
                job.state.as_str(),
                job.error,
                job.batch_size as i64,
                job.batch_timeout_secs,
                job.clock_drift_secs,
            ],
        )
        .map_err(db_err)?;
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
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(db_err)?;

        let (job, _) = tx
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], job_from_row)
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| StoreError::unknown(id))?;

        if job.state == new_state {
            return Ok(job);
        }
        if !job.state.can_transition_to(new_state) {
            return Err(StoreError::InvalidTransition {
                from: job.state,
                to: new_state,
            });
        }

        let updated = job.with_state(timestamp, new_state, error);
        tx.execute(
            "UPDATE jobs SET updated = ?2, started = ?3, completed = ?4, state = ?5, error = ?6 \
             WHERE id = ?1",
            params![
                id,
                ts(updated.updated),
                updated.started.map(ts),
                updated.completed.map(ts),
                updated.state.as_str(),
                updated.error,
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(updated)
    }

    async fn retrieve_job(&self, id: &str, cancel: &CancellationToken) -> StoreResult<Job> {
        ensure_live(cancel)?;
        self.lock()
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], job_from_row)
            .optional()
            .map_err(db_err)?
            .map(|(job, _)| job)
            .ok_or_else(|| StoreError::unknown(id))
    }

    async fn insert_partition(
        &self,
        partition: Partition,
        cancel: &CancellationToken,
    ) -> StoreResult<()> {
        ensure_live(cancel)?;
        let conn = self.lock();
        if !job_exists(&conn, &partition.job_id)? {
            return Err(StoreError::InvalidReference(partition.job_id.clone()));
        }
        if get_partition(&conn, partition.id)?.is_some() {
            return Err(StoreError::duplicate(partition.id));
        }
        insert_partition_row(&conn, &partition).map_err(db_err)
    }

    async fn retrieve_partition(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> StoreResult<Partition> {
        ensure_live(cancel)?;
        get_partition(&self.lock(), id)?.ok_or_else(|| StoreError::unknown(id))
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
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(db_err)?;

        if !tx
            .query_row("SELECT 1 FROM jobs WHERE id = ?1", params![job_id], |_| Ok(()))
            .optional()
            .map_err(db_err)?
            .is_some()
        {
            return Err(StoreError::unknown(job_id));
        }

        let candidate = tx
            .query_row(
                "SELECT id, owner FROM partitions \
                 WHERE job_id = ?1 AND is_completed = 0 \
                   AND (owner IS NULL OR updated < ?2) \
                 ORDER BY remaining DESC, id ASC LIMIT 1",
                params![job_id, ts(active_cutoff)],
                |row| {
                    Ok((
                        row.get::<_, String>("id")?,
                        row.get::<_, Option<String>>("owner")?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        let Some((id_raw, previous_owner)) = candidate else {
            return Ok(None);
        };

        if previous_owner.is_some() {
            tx.execute(
                "UPDATE jobs SET lease_takeovers = lease_takeovers + 1 WHERE id = ?1",
                params![job_id],
            )
            .map_err(db_err)?;
        }
        tx.execute(
            "UPDATE partitions SET owner = ?2, updated = ?3, is_split_requested = 0 \
             WHERE id = ?1",
            params![id_raw, requester, ts(now)],
        )
        .map_err(db_err)?;

        let leased = tx
            .query_row(
                "SELECT * FROM partitions WHERE id = ?1",
                params![id_raw],
                partition_from_row,
            )
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(Some(leased))
    }

    async fn try_request_split(
        &self,
        job_id: &str,
        active_cutoff: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> StoreResult<bool> {
        ensure_live(cancel)?;
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(db_err)?;

        if !tx
            .query_row("SELECT 1 FROM jobs WHERE id = ?1", params![job_id], |_| Ok(()))
            .optional()
            .map_err(db_err)?
            .is_some()
        {
            return Err(StoreError::unknown(job_id));
        }

        let candidate = tx
            .query_row(
                "SELECT id FROM partitions \
                 WHERE job_id = ?1 AND is_completed = 0 AND is_split_requested = 0 \
                   AND owner IS NOT NULL AND updated >= ?2 \
                 ORDER BY remaining DESC, id ASC LIMIT 1",
                params![job_id, ts(active_cutoff)],
                |row| row.get::<_, String>("id"),
            )
            .optional()
            .map_err(db_err)?;

        let Some(id_raw) = candidate else {
            return Ok(false);
        };

        tx.execute(
            "UPDATE partitions SET is_split_requested = 1 WHERE id = ?1",
            params![id_raw],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
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
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(db_err)?;

        let stored = tx
            .query_row(
                "SELECT * FROM partitions WHERE id = ?1",
                params![id.hyphenated().to_string()],
                partition_from_row,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| StoreError::unknown(id))?;

        if stored.owner.as_deref() != Some(owner) {
            return Err(StoreError::Lock {
                id,
                requester: owner.to_string(),
                holder: stored.owner,
            });
        }
        if stored.is_completed {
            return Ok(stored);
        }

        let updated = stored.with_progress(&update, now);
        tx.execute(
            "UPDATE partitions SET updated = ?2, position = ?3, processed = ?4, \
             remaining = ?5, is_completed = ?6, throughput = ?7 WHERE id = ?1",
            params![
                id.hyphenated().to_string(),
                ts(updated.updated),
                updated.position,
                updated.processed as i64,
                updated.remaining as i64,
                updated.is_completed,
                updated.throughput,
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(updated)
    }

    async fn insert_split_partition(
        &self,
        update: Partition,
        insert: Partition,
        cancel: &CancellationToken,
    ) -> StoreResult<()> {
        ensure_live(cancel)?;
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(db_err)?;

        let stored = tx
            .query_row(
                "SELECT * FROM partitions WHERE id = ?1",
                params![update.id.hyphenated().to_string()],
                partition_from_row,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| StoreError::unknown(update.id))?;

        if stored.owner != update.owner {
            return Err(StoreError::Lock {
                id: update.id,
                requester: update.owner.clone().unwrap_or_default(),
                holder: stored.owner,
            });
        }
        if tx
            .query_row(
                "SELECT 1 FROM partitions WHERE id = ?1",
                params![insert.id.hyphenated().to_string()],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err)?
            .is_some()
        {
            return Err(StoreError::duplicate(insert.id));
        }

        tx.execute(
            "UPDATE partitions SET updated = ?2, last_key = ?3, is_inclusive = ?4, \
             remaining = ?5, is_split_requested = 0 WHERE id = ?1",
            params![
                update.id.hyphenated().to_string(),
                ts(update.updated),
                update.range.last,
                update.range.is_inclusive,
                update.remaining as i64,
            ],
        )
        .map_err(db_err)?;
        insert_partition_row(&tx, &insert).map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    async fn count_incomplete_partitions(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<u64> {
        ensure_live(cancel)?;
        let conn = self.lock();
        if !job_exists(&conn, job_id)? {
            return Err(StoreError::unknown(job_id));
        }
        conn.query_row(
            "SELECT COUNT(*) FROM partitions WHERE job_id = ?1 AND is_completed = 0",
            params![job_id],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as u64)
        .map_err(db_err)
    }

    async fn retrieve_job_status_report(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> StoreResult<JobStatusReport> {
        ensure_live(cancel)?;
        let conn = self.lock();
        let (job, takeovers) = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![job_id], job_from_row)
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| StoreError::unknown(job_id))?;

        let mut stmt = conn
            .prepare("SELECT * FROM partitions WHERE job_id = ?1")
            .map_err(db_err)?;
        let partitions: Vec<Partition> = stmt
            .query_map(params![job_id], partition_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err)?;

        Ok(crate::store::build_status_report(
            &job,
            partitions.iter(),
            takeovers,
            now,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::SubsecRound;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_schema_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let job = Job::new("j1", now, 100, 30, 5);
        store.insert_job(job.clone(), &token()).await.unwrap();

        let loaded = store.retrieve_job("j1", &token()).await.unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.state, JobState::Initializing);
        assert_eq!(loaded.batch_size, 100);
        assert_eq!(loaded.batch_timeout_secs, 30);

        let p = Partition::new(
            "j1",
            Range::inclusive("0".to_string(), "999".to_string()),
            1000,
            now,
        );
        store.insert_partition(p.clone(), &token()).await.unwrap();
        let loaded = store.retrieve_partition(p.id, &token()).await.unwrap();
        assert_eq!(loaded.range, p.range);
        assert_eq!(loaded.remaining, 1000);
        assert!(loaded.owner.is_none());
    }

    #[tokio::test]
    async fn test_remove_schema_drops_tables() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.remove_schema().unwrap();
        let err = store.count_jobs(&token()).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));

        // Redeploy restores an empty store
        store.deploy_schema().unwrap();
        assert_eq!(store.count_jobs(&token()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_timestamp_text_ordering() {
        let early = Utc::now();
        let late = early + chrono::Duration::microseconds(1500);
        assert!(ts(early) < ts(late));
        assert_eq!(parse_ts(&ts(early)).unwrap(), early.trunc_subsecs(6));
    }
}
