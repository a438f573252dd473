use crate::error::SourceError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use watchmatch_config::RetryConfig;

/// Exponential backoff with optional jitter, shared by the page fetcher and
/// the metadata client.
///
/// The delay after failed attempt `n` (1-based) is `base_delay * 2^(n-1)`,
/// capped at `max_delay`. With jitter enabled the delay is drawn uniformly
/// from the upper half of that range. A `Retry-After` hint on the error
/// raises the delay (still capped).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    retryable: fn(&SourceError) -> bool,
}

/// Outcome of [`RetryPolicy::run`] with the number of attempts made
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, SourceError>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: true,
            retryable: SourceError::is_retryable,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the retryable-error predicate
    pub fn with_predicate(mut self, retryable: fn(&SourceError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn is_retryable(&self, error: &SourceError) -> bool {
        (self.retryable)(error)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        if self.jitter && !delay.is_zero() {
            let half = delay / 2;
            rand::thread_rng().gen_range(half..=delay)
        } else {
            delay
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt cap is reached. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Attempted<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(e) if attempt < self.max_attempts && self.is_retryable(&e) => {
                    let mut delay = self.backoff(attempt);
                    if let Some(hint) = e.retry_after() {
                        delay = delay.max(hint.min(self.max_delay));
                    }
                    debug!(
                        operation = "retry_backoff",
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Attempted {
                        result: Err(e),
                        attempts: attempt,
                    }
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
        .with_jitter(config.jitter)
    }
}
