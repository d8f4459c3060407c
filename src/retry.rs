//! Retry logic with exponential backoff
//!
//! Configurable retry for transient failures, with exponential backoff and
//! optional jitter to prevent thundering herd. The policy is injected into
//! the fetch engine via [`crate::config::RetryConfig`], so the concurrency
//! core can be exercised against a fake transport with no real network.

use crate::config::RetryConfig;
use crate::error::{Error, FetchError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, refused connections, short reads) should
/// return `true`. Permanent failures (bad configuration, canceled work,
/// missing range support) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            // Connectivity failures are always recoverable
            FetchError::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            FetchError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            // A truncated range response is usually a flaky middlebox
            FetchError::ShortRead { .. } => true,
            // Server-side hiccups are worth retrying; client errors are not
            FetchError::UnexpectedStatus { status, .. } => *status >= 500 || *status == 429,
            // The probe either works or the file is handled single-stream
            FetchError::Probe { .. } => false,
            // Range support does not appear on retry
            FetchError::RangeNotSupported { .. } => false,
            // Exhausted chunks already spent their budget
            FetchError::ChunkExhausted { .. } => false,
            // Shutdown must not fight the retry loop
            FetchError::Canceled => false,
        }
    }
}

impl IsRetryable for crate::error::IngestError {
    fn is_retryable(&self) -> bool {
        use crate::error::IngestError;
        match self {
            // A rejected batch may be a transient store condition; the
            // resilient wrapper retries on a raised budget before classifying
            IngestError::Store { .. } => true,
            IngestError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
            ),
            IngestError::Decode { .. }
            | IngestError::EmptyPayload(_)
            | IngestError::RecoveryFailed { .. } => false,
        }
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Fetch(e) => e.is_retryable(),
            Error::Network(e) => e.is_timeout() || e.is_connect(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::Interrupted
            ),
            Error::Config { .. }
            | Error::Ingest(_)
            | Error::Serialization(_)
            | Error::ShuttingDown
            | Error::NoUsableData { .. }
            | Error::Other(_) => false,
        }
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// `max_attempts` counts retries after the first try; the operation runs at
/// most `max_attempts + 1` times. Returns the successful result or the last
/// error once the budget is exhausted or a non-retryable error appears.
pub async fn retry_with_policy<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                let jittered_delay = if config.jitter { add_jitter(delay) } else { delay };
                tokio::time::sleep(jittered_delay).await;

                let next_delay =
                    Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                delay = next_delay.min(config.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "Operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// actual delay falls between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
