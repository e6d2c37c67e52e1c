//! Retry utilities for resilient operations
//!
//! Bounded retry with a pluggable delay schedule and a pluggable predicate
//! deciding which errors are transient. Store and data-source calls made by
//! the processing engine are wrapped here so transient infrastructure
//! failures never reach the partition state machine.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// How long to wait before each retry attempt.
#[derive(Debug, Clone)]
pub enum DelaySchedule {
    /// Same delay before every retry
    Constant(Duration),

    /// Preset delays per attempt; the last entry repeats when attempts
    /// outnumber entries
    Sequence(Vec<Duration>),

    /// Exponential backoff from `base`, capped at `max`
    Exponential {
        base: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl DelaySchedule {
    /// Delay before retry `attempt` (1-based; attempt 0 is the initial try
    /// and never waits).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self {
            Self::Constant(d) => *d,
            Self::Sequence(delays) => match delays.as_slice() {
                [] => Duration::ZERO,
                ds => *ds.get(attempt as usize - 1).unwrap_or(ds.last().expect("non-empty")),
            },
            Self::Exponential {
                base,
                max,
                multiplier,
            } => {
                let exponential =
                    base.as_millis() as f64 * multiplier.powi(attempt as i32 - 1);
                Duration::from_millis((exponential as u64).min(max.as_millis() as u64))
            }
        }
    }
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts beyond the initial try
    pub max_retries: u32,

    /// Delay schedule between attempts
    pub schedule: DelaySchedule,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            schedule: DelaySchedule::Exponential {
                base: Duration::from_millis(1000),
                max: Duration::from_millis(30_000),
                multiplier: 2.0,
            },
        }
    }
}

impl RetryConfig {
    /// Retry configuration with custom max retries and the default
    /// exponential schedule
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Constant-delay configuration
    pub fn constant(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            schedule: DelaySchedule::Constant(delay),
        }
    }

    /// No retries at all; the initial attempt is the only one
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            schedule: DelaySchedule::Constant(Duration::ZERO),
        }
    }
}

/// Execute an operation with retry, treating every error as retryable.
///
/// Returns `Ok` on the first success, or the last error once
/// `max_retries` is exhausted.
pub async fn with_retry<T, E, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    with_retry_if(config, operation, |_| true).await
}

/// Execute an operation with retry, retrying only errors accepted by
/// `is_transient`.
///
/// A non-transient error is returned immediately; exhausting the attempt
/// budget surfaces the last error.
pub async fn with_retry_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    operation: F,
    is_transient: P,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut last_error = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = config.schedule.delay_for(attempt);
            debug!(
                attempt = attempt,
                delay_ms = delay.as_millis(),
                "Retrying operation after delay"
            );
            tokio::time::sleep(delay).await;
        }

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                if !is_transient(&e) {
                    return Err(e);
                }
                warn!(
                    attempt = attempt,
                    max_retries = config.max_retries,
                    error = %e,
                    "Transient failure, will retry"
                );
                last_error = Some(e);
            }
        }
    }

    Err(last_error.expect("at least one attempt ran"))
}
