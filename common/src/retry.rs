//! Bounded exponential backoff around a whole upload or download.
//!
//! A retry re-runs the complete operation, which re-detects the resume offset and continues from
//! whatever the part file holds. Individual chunks are never replayed.

use std::future::Future;
use std::time::Duration;

use crate::integrity::IntegrityError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

const TRANSIENT_MESSAGES: [&str; 6] = [
    "connection reset",
    "broken pipe",
    "connection refused",
    "i/o timeout",
    "network is unreachable",
    "no route to host",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

impl RetryConfig {
    /// Default policy with the given attempt budget; a non-positive budget means the default of 3
    pub fn with_max_attempts(max_attempts: i64) -> Self {
        let max_attempts = if max_attempts <= 0 {
            DEFAULT_MAX_ATTEMPTS
        } else {
            u32::try_from(max_attempts).unwrap_or(u32::MAX)
        };
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Delay to wait after `delay`, never more than `max_delay`
    fn next_delay(&self, delay: Duration) -> Duration {
        let grown = Duration::try_from_secs_f64(delay.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max_delay);
        grown.min(self.max_delay)
    }
}

/// Terminal error after the attempt budget is used up
#[derive(Debug, thiserror::Error)]
#[error("max retries exceeded: {last:#}")]
pub struct RetriesExhausted {
    pub attempts: u32,
    #[source]
    pub last: anyhow::Error,
}

/// Transient network failures are retryable, everything else is fatal.
///
/// The whole error chain is inspected: an `io::Error` of kind `TimedOut` anywhere in it, or any
/// message containing one of the known transient failure phrases. Integrity failures are never
/// retried.
pub fn is_retryable(error: &anyhow::Error) -> bool {
    if error
        .chain()
        .any(|cause| cause.downcast_ref::<IntegrityError>().is_some())
    {
        return false;
    }
    if error.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io_error| io_error.kind() == std::io::ErrorKind::TimedOut)
    }) {
        return true;
    }
    let message = format!("{error:#}").to_lowercase();
    TRANSIENT_MESSAGES
        .iter()
        .any(|transient| message.contains(transient))
}

pub async fn with_retry<T, F, Fut>(config: &RetryConfig, mut operation: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    let mut attempt = 1;
    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if !is_retryable(&error) {
            tracing::debug!("attempt {attempt} failed with a non-retryable error");
            return Err(error);
        }
        if attempt >= max_attempts {
            return Err(RetriesExhausted {
                attempts: attempt,
                last: error,
            }
            .into());
        }
        tracing::warn!(
            "attempt {}/{} failed: {:#}, retrying in {}",
            attempt,
            max_attempts,
            &error,
            humantime::format_duration(delay)
        );
        tokio::time::sleep(delay).await;
        delay = config.next_delay(delay);
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    fn reset() -> anyhow::Error {
        anyhow!("read failed: Connection reset by peer")
    }

    #[test]
    fn attempt_budget_defaults() {
        assert_eq!(RetryConfig::with_max_attempts(0).max_attempts, 3);
        assert_eq!(RetryConfig::with_max_attempts(-4).max_attempts, 3);
        assert_eq!(RetryConfig::with_max_attempts(7).max_attempts, 7);
        let config = RetryConfig::with_max_attempts(5);
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.multiplier, 2.0);
    }

    #[test]
    fn classification() {
        assert!(is_retryable(&reset()));
        assert!(is_retryable(&anyhow!("write: BROKEN PIPE")));
        assert!(is_retryable(&anyhow!("dial tcp: connection refused")));
        assert!(is_retryable(&anyhow!("i/o timeout")));
        assert!(is_retryable(&anyhow!("connect: Network is unreachable")));
        assert!(is_retryable(&anyhow!("connect: No route to host")));
        let timeout = anyhow::Error::from(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "took too long",
        ))
        .context("failed writing chunk");
        assert!(is_retryable(&timeout));
        assert!(!is_retryable(&anyhow!("permission denied")));
        assert!(!is_retryable(&anyhow!("no such file")));
        // context on top of a transient cause does not hide it
        assert!(is_retryable(&reset().context("upload failed")));
    }

    #[test]
    fn integrity_errors_are_fatal() {
        let error = anyhow::Error::from(IntegrityError::RemoteDigest {
            path: "/x".into(),
            reason: "connection reset while reading".to_string(),
        })
        .context("integrity check failed");
        assert!(!is_retryable(&error));
    }

    #[test]
    fn delay_growth_is_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(8),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        };
        assert_eq!(config.next_delay(Duration::from_secs(8)), Duration::from_secs(16));
        assert_eq!(config.next_delay(Duration::from_secs(16)), Duration::from_secs(30));
        assert_eq!(config.next_delay(Duration::from_secs(30)), Duration::from_secs(30));
    }

    /// Runs an operation failing with `error` until the `succeed_on`-th attempt and records
    /// the (virtual) time between consecutive attempts
    async fn run_schedule(
        config: RetryConfig,
        succeed_on: usize,
        error: fn() -> anyhow::Error,
    ) -> (anyhow::Result<usize>, Vec<Duration>) {
        let starts = Mutex::new(Vec::new());
        let result = with_retry(&config, || {
            let attempt = {
                let mut starts = starts.lock().unwrap();
                starts.push(tokio::time::Instant::now());
                starts.len()
            };
            async move {
                if attempt >= succeed_on {
                    Ok(attempt)
                } else {
                    Err(error())
                }
            }
        })
        .await;
        let starts = starts.into_inner().unwrap();
        let gaps = starts.windows(2).map(|pair| pair[1] - pair[0]).collect();
        (result, gaps)
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn succeeds_on_kth_attempt_with_exponential_delays() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
            multiplier: 2.0,
        };
        let (result, gaps) = run_schedule(config, 4, reset).await;
        assert_eq!(result.unwrap(), 4);
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
            ]
        );
        assert!(logs_contain("attempt 1/5 failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_wraps_last_error() {
        let config = RetryConfig::with_max_attempts(3);
        let (result, gaps) = run_schedule(config, usize::MAX, reset).await;
        let error = result.unwrap_err();
        let exhausted = error.downcast_ref::<RetriesExhausted>().unwrap();
        assert_eq!(exhausted.attempts, 3);
        assert!(
            error
                .to_string()
                .starts_with("max retries exceeded: read failed")
        );
        assert_eq!(gaps, vec![Duration::from_secs(1), Duration::from_secs(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_short_circuits() {
        let config = RetryConfig::with_max_attempts(10);
        let (result, gaps) =
            run_schedule(config, usize::MAX, || anyhow!("permission denied")).await;
        let error = result.unwrap_err();
        assert!(error.downcast_ref::<RetriesExhausted>().is_none());
        assert_eq!(error.to_string(), "permission denied");
        assert!(gaps.is_empty());
    }
}
