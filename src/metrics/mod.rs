//! Prometheus metrics for workers and the scheduler
//!
//! Call [`init_metrics`] once at application startup to register all
//! metrics. If initialization fails (or never ran), metric operations
//! become no-ops so library users are never forced into the registry.

use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

/// Container for all engine metrics
struct EngineMetrics {
    leases_acquired: CounterVec,
    leases_lost: CounterVec,
    batches_retrieved: CounterVec,
    batch_items: CounterVec,
    batches_processed: CounterVec,
    batch_duration: HistogramVec,
    progress_reports: CounterVec,
    partitions_completed: CounterVec,
    partitions_split: CounterVec,
    splits_declined: CounterVec,
    active_workers: GaugeVec,
}

static ENGINE_METRICS: OnceLock<EngineMetrics> = OnceLock::new();

static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

/// Initialize all Prometheus metrics.
///
/// Safe to call more than once; only the first call registers.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let engine = EngineMetrics {
        leases_acquired: register_counter_vec!(
            "rangeflow_leases_acquired_total",
            "Partition leases acquired, by job",
            &["job"]
        )?,
        leases_lost: register_counter_vec!(
            "rangeflow_leases_lost_total",
            "Leases lost to takeover, by job",
            &["job"]
        )?,
        batches_retrieved: register_counter_vec!(
            "rangeflow_batches_retrieved_total",
            "Batches fetched from the data source, by job",
            &["job"]
        )?,
        batch_items: register_counter_vec!(
            "rangeflow_batch_items_total",
            "Items fetched from the data source, by job",
            &["job"]
        )?,
        batches_processed: register_counter_vec!(
            "rangeflow_batches_processed_total",
            "Batches handed to the processor, by job and outcome",
            &["job", "status"]
        )?,
        batch_duration: register_histogram_vec!(
            "rangeflow_batch_duration_seconds",
            "End-to-end duration of one fetch/process/report cycle, by job",
            &["job"]
        )?,
        progress_reports: register_counter_vec!(
            "rangeflow_progress_reports_total",
            "Progress reports, by job and outcome",
            &["job", "status"]
        )?,
        partitions_completed: register_counter_vec!(
            "rangeflow_partitions_completed_total",
            "Partitions exhausted, by job",
            &["job"]
        )?,
        partitions_split: register_counter_vec!(
            "rangeflow_partitions_split_total",
            "Committed splits, by job",
            &["job"]
        )?,
        splits_declined: register_counter_vec!(
            "rangeflow_splits_declined_total",
            "Split requests declined as unsplittable, by job",
            &["job"]
        )?,
        active_workers: register_gauge_vec!(
            "rangeflow_active_workers",
            "Worker slots currently processing, by job",
            &["job"]
        )?,
    };

    ENGINE_METRICS.set(engine).ok();
    Ok(())
}

fn engine() -> Option<&'static EngineMetrics> {
    ENGINE_METRICS.get()
}

pub fn record_lease_acquired(job: &str) {
    if let Some(m) = engine() {
        m.leases_acquired.with_label_values(&[job]).inc();
    }
}

pub fn record_lease_lost(job: &str) {
    if let Some(m) = engine() {
        m.leases_lost.with_label_values(&[job]).inc();
    }
}

pub fn record_batch_retrieved(job: &str, items: usize) {
    if let Some(m) = engine() {
        m.batches_retrieved.with_label_values(&[job]).inc();
        m.batch_items.with_label_values(&[job]).inc_by(items as f64);
    }
}

pub fn record_batch_processed(job: &str, success: bool, duration_secs: f64) {
    if let Some(m) = engine() {
        let status = if success { "success" } else { "failure" };
        m.batches_processed.with_label_values(&[job, status]).inc();
        m.batch_duration
            .with_label_values(&[job])
            .observe(duration_secs);
    }
}

pub fn record_progress_report(job: &str, success: bool) {
    if let Some(m) = engine() {
        let status = if success { "success" } else { "failure" };
        m.progress_reports.with_label_values(&[job, status]).inc();
    }
}

pub fn record_partition_completed(job: &str) {
    if let Some(m) = engine() {
        m.partitions_completed.with_label_values(&[job]).inc();
    }
}

pub fn record_partition_split(job: &str) {
    if let Some(m) = engine() {
        m.partitions_split.with_label_values(&[job]).inc();
    }
}

pub fn record_split_declined(job: &str) {
    if let Some(m) = engine() {
        m.splits_declined.with_label_values(&[job]).inc();
    }
}

pub fn worker_started(job: &str) {
    if let Some(m) = engine() {
        m.active_workers.with_label_values(&[job]).inc();
    }
}

pub fn worker_stopped(job: &str) {
    if let Some(m) = engine() {
        m.active_workers.with_label_values(&[job]).dec();
    }
}

/// Render all registered metrics in the Prometheus text format.
pub fn export_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
