//! Retry utilities: backoff builders for connection-level failures.
//!
//! Uses `backon` for exponential backoff with jitter. Only errors classified
//! by [`HistoryError::is_transient`] are retried; everything else surfaces
//! on the first attempt.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::error::HistoryError;

/// Backoff for re-running an operation after a dropped connection.
///
/// - Min delay: 50ms
/// - Max delay: 2s
/// - Max attempts: `max_times`
/// - Jitter enabled
pub fn transient_backoff(max_times: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(max_times)
        .with_jitter()
}

/// Backoff for opening the pool at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: `max_times`
/// - Jitter enabled
pub fn connect_backoff(max_times: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(max_times)
        .with_jitter()
}

/// Determines if an error is worth retrying on a fresh connection.
///
/// Retryable:
/// - socket, TLS and protocol failures
/// - SQLSTATE class `08` and server shutdown codes
///
/// Non-retryable: pool exhaustion (the caller decides), validation, codec
/// and every other database error.
pub fn is_retryable(err: &HistoryError) -> bool {
    err.is_transient()
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;

    #[test]
    fn test_is_retryable() {
        let io = HistoryError::from(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "broken pipe",
        )));
        assert!(is_retryable(&io));
        assert!(!is_retryable(&HistoryError::PoolExhausted {
            waited: Duration::from_secs(1)
        }));
        assert!(!is_retryable(&HistoryError::Validation("bad".into())));
        assert!(!is_retryable(&HistoryError::NotInitialized));
    }

    #[test]
    fn test_backoff_is_bounded() {
        let delays: Vec<_> = transient_backoff(3).build().collect();
        assert_eq!(delays.len(), 3);
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(4)));

        assert_eq!(connect_backoff(0).build().count(), 0);
    }
}
