//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Longest pause between broker reconnect attempts.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Backoff for broker reconnects after the initial connection.
///
/// - Min delay: 100ms, doubling per attempt
/// - Max delay: 30s
/// - Jitter enabled
/// - No attempt limit
///
/// The iterator never runs out. Callers rebuild it after a successful
/// reconnect to start again from the minimum delay.
pub fn reconnect_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(MAX_RECONNECT_DELAY)
        .with_jitter()
        .without_max_times()
}
