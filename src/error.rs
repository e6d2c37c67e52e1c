//! Unified error handling for the rangeflow crate
//!
//! Domain modules define their own error enums ([`StoreError`],
//! [`SourceError`], [`ProcessError`], [`KeyError`]); this module wraps them
//! into a single [`Error`] usable across module boundaries without losing
//! the detailed variants, and classifies every error for retry and
//! reporting strategies.

use thiserror::Error;

pub use crate::keyspace::KeyError;
pub use crate::source::{ProcessError, SourceError};
pub use crate::store::StoreError;

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Engine data store failures
    Store,
    /// External data source failures
    Source,
    /// Batch processor failures
    Processing,
    /// Key serialization failures
    Key,
    /// Configuration and validation errors
    Config,
    /// Other/unknown errors
    Other,
}

/// Unified error type for the rangeflow crate
#[derive(Error, Debug)]
pub enum Error {
    /// Engine data store errors
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// External data source errors
    #[error("data source error: {0}")]
    Source(#[from] SourceError),

    /// Batch processor errors
    #[error("batch processing error: {0}")]
    Process(#[from] ProcessError),

    /// Key serialization errors
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    /// Configuration errors
    #[error("config error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Whether retrying the same operation can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Source(e) => e.is_transient(),
            Self::Process(e) => e.is_transient(),
            Self::Key(_) => false,
            Self::Config(_) => false,
            Self::Io(_) => true,
            Self::Json(_) => false,
            Self::Other { .. } => false,
        }
    }

    /// Get the error category for handling strategies.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Store(_) => ErrorCategory::Store,
            Self::Source(_) => ErrorCategory::Source,
            Self::Process(_) => ErrorCategory::Processing,
            Self::Key(_) => ErrorCategory::Key,
            Self::Config(_) => ErrorCategory::Config,
            Self::Io(_) | Self::Json(_) | Self::Other { .. } => ErrorCategory::Other,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
