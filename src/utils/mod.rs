//! Common utilities and helpers

pub mod retry;

pub use retry::{with_retry, with_retry_if, DelaySchedule, RetryConfig};
