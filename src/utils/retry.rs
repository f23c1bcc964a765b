//! Retry utilities: backoff presets for transport establishment.
//!
//! Uses `backon` for exponential backoff with jitter. Store operations
//! themselves are never retried by the client; see
//! [`ClientError::is_retryable`](crate::error::ClientError::is_retryable)
//! for what a caller may retry.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for connecting to a store at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Connection backoff capped at `attempts` retries.
pub fn bounded_connection_backoff(attempts: usize) -> ExponentialBuilder {
    connection_backoff().with_max_times(attempts)
}
