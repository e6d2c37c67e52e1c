//! rangeflow - distributed processing of ordered key ranges
//!
//! A lease-based, storage-arbitrated system for spreading one large ordered
//! key space across any number of independent, uncoordinated worker nodes.
//! Workers never talk to each other: every hand-off happens through atomic
//! operations on a shared store, so crashed or stalled workers are recovered
//! by lease expiry and in-flight partitions can be split to feed idle
//! workers.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`models`] - Jobs, partitions, ranges and progress reports
//! - [`keyspace`] - Key arithmetic and serialization per key type
//! - [`store`] - The atomic data-store contract and its in-memory reference
//! - [`storage`] - SQLite store backend
//! - [`engine`] - Per-worker processing state machine and splitting
//! - [`scheduler`] - Job bootstrap, status aggregation and rebalancing
//! - [`source`] - External data source and batch processor interfaces
//! - [`events`] - Observational event sink
//! - [`metrics`] - Prometheus metrics
//! - [`utils`] - Retry helpers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! use rangeflow::engine::{EngineConfig, ProcessingEngine};
//! use rangeflow::events::TracingSink;
//! use rangeflow::keyspace::Int64Keys;
//! use rangeflow::scheduler::{JobSettings, Scheduler};
//! use rangeflow::source::{RecordingProcessor, SequenceSource};
//! use rangeflow::store::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let source = Arc::new(SequenceSource::ascending(0, 9_999));
//!     let cancel = CancellationToken::new();
//!
//!     let scheduler = Scheduler::new(store.clone(), Arc::new(TracingSink));
//!     scheduler
//!         .schedule(&Int64Keys, source.as_ref(), JobSettings::new("demo"), &cancel)
//!         .await?;
//!
//!     let engine = ProcessingEngine::new(
//!         store,
//!         Arc::new(Int64Keys),
//!         source,
//!         Arc::new(RecordingProcessor::new()),
//!         Arc::new(TracingSink),
//!         EngineConfig::new("worker-1"),
//!     );
//!     engine.run("demo", &cancel).await?;
//!     Ok(())
//! }
//! ```

pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod keyspace;
pub mod metrics;
pub mod models;
pub mod scheduler;
pub mod source;
pub mod storage;
pub mod store;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::engine::{EngineConfig, PartitionFailurePolicy, ProcessingEngine, SplitEstimate};
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::events::{EventSink, NoopSink, TracingSink};
    pub use crate::keyspace::{BigIntKeys, Int32Keys, Int64Keys, KeySpace, StringKeys, UuidKeys};
    pub use crate::models::{Job, JobState, JobStatusReport, Partition, ProgressUpdate, Range};
    pub use crate::scheduler::{JobSettings, RebalanceConfig, Rebalancer, Scheduler};
    pub use crate::source::{BatchProcessor, DataSource};
    pub use crate::store::{EngineStore, MemoryStore, StoreError};
    pub use crate::storage::SqliteStore;
}

// Direct re-exports for convenience
pub use error::{Error, Result};
pub use models::{Job, JobState, Partition, Range};
