//! Monitor job status

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;

use crate::events::NoopSink;
use crate::models::{JobState, JobStatusReport};
use crate::scheduler::Scheduler;
use crate::storage::SqliteStore;

/// Column header matching [`format_status_line`].
pub fn status_header() -> String {
    format!(
        "{:<24} {:<12} {:<8} {:<8} {:>5}/{:>5}/{:>5} {:>10}/{:>10} {:>9} {:>6}",
        "timestamp",
        "state",
        "started",
        "done",
        "free",
        "busy",
        "compl",
        "keys done",
        "keys left",
        "takeovers",
        "splits",
    )
}

fn short_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// One fixed-width status line for interval polling.
pub fn format_status_line(report: &JobStatusReport, now: DateTime<Utc>) -> String {
    format!(
        "{:<24} {:<12} {:<8} {:<8} {:>5}/{:>5}/{:>5} {:>10}/{:>10} {:>9} {:>6}",
        now.to_rfc3339_opts(SecondsFormat::Secs, true),
        report.state.as_str(),
        short_time(report.started),
        short_time(report.completed),
        report.partitions_untouched,
        report.partitions_in_progress,
        report.partitions_completed,
        report.keys_completed,
        report.keys_remaining,
        report.lease_takeovers,
        report.pending_splits,
    )
}

/// Poll a job's status on an interval, printing one line per poll, until
/// the job reaches a terminal state. With `once`, print a single line and
/// return.
pub async fn monitor(db: &Path, job_id: &str, interval_secs: u64, once: bool) -> Result<()> {
    let store = Arc::new(SqliteStore::open(db).context("opening store")?);
    let scheduler = Scheduler::new(store, Arc::new(NoopSink));
    let cancel = CancellationToken::new();

    println!("{}", status_header());
    loop {
        let report = scheduler
            .get_job_state(job_id, &cancel)
            .await
            .context("retrieving job status")?;
        println!("{}", format_status_line(&report, Utc::now()));

        if once || matches!(report.state, JobState::Completed | JobState::Failed) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(interval_secs.max(1))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> JobStatusReport {
        JobStatusReport {
            job_id: "j1".to_string(),
            state: JobState::Processing,
            started: Some(Utc::now()),
            completed: None,
            partitions_untouched: 1,
            partitions_in_progress: 2,
            partitions_completed: 3,
            keys_completed: 1500,
            keys_remaining: 8500,
            throughput: 120.5,
            pending_splits: 1,
            lease_takeovers: 0,
            last_activity: Some(Utc::now()),
        }
    }

    #[test]
    fn test_status_line_is_fixed_width() {
        let now = Utc::now();
        let a = format_status_line(&sample_report(), now);
        let mut other = sample_report();
        other.keys_completed = 1;
        other.state = JobState::Ready;
        other.started = None;
        let b = format_status_line(&other, now);
        assert_eq!(a.len(), b.len());
        assert_eq!(status_header().len(), a.len());
    }

    #[test]
    fn test_status_line_contents() {
        let line = format_status_line(&sample_report(), Utc::now());
        assert!(line.contains("processing"));
        assert!(line.contains("1500"));
        assert!(line.contains("8500"));
    }
}
