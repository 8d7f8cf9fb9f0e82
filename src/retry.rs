//! Retry helpers for transient failures.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::error::{ConnectionError, Error};

/// Trait for errors that can be classified as retryable or not.
///
/// Transient failures (timeouts, resets, peer closes) should return
/// `true`; permanent failures (auth rejected, decode errors, disk full)
/// should return `false`.
pub trait IsRetryable {
    /// Returns true if the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Connection(e) => e.is_transient(),
            Error::UrlFetch(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            // content, config, queue, and disk errors are permanent
            _ => false,
        }
    }
}

impl IsRetryable for ConnectionError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Run `operation` up to `1 + retries` times, sleeping `interval` between
/// attempts (with up to 25% jitter when enabled). Non-retryable errors
/// and exhaustion return the last error.
pub async fn with_retries<F, Fut, T, E>(
    retries: u32,
    interval: Duration,
    jitter: bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < retries => {
                attempt += 1;
                tracing::warn!(
                    error = %e,
                    attempt,
                    retries,
                    delay_ms = interval.as_millis(),
                    "operation failed, retrying"
                );
                tokio::time::sleep(jittered(interval, jitter)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn jittered(interval: Duration, jitter: bool) -> Duration {
    if !jitter || interval.is_zero() {
        return interval;
    }
    let spread = interval.as_millis() as u64 / 4;
    if spread == 0 {
        return interval;
    }
    interval + Duration::from_millis(rand::thread_rng().gen_range(0..spread))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum TestError {
        Transient,
        Permanent,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl IsRetryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retries(5, Duration::ZERO, false, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TestError::Transient)
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(5, Duration::ZERO, false, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Permanent)
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_return_the_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(2, Duration::ZERO, false, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Transient)
        })
        .await;

        assert!(matches!(result.unwrap_err(), TestError::Transient));
        assert_eq!(calls.load(Ordering::SeqCst), 3, "1 attempt + 2 retries");
    }

    #[test]
    fn connection_error_classification_feeds_retry() {
        assert!(ConnectionError::PeerClosed.is_retryable());
        assert!(!ConnectionError::Cancelled.is_retryable());
    }
}
