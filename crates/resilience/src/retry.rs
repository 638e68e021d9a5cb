//! Retry with exponential backoff and jitter.
//!
//! The executor only retries errors whose [`RetryClass`] is `WithBackoff`.
//! Permanent failures, open circuits and exhausted quotas return at once
//! without sleeping.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;

use crate::errors::{ErrorKind, ErrorPolicy, ProviderError, ResilienceError, RetryClass};

/// Default number of retries after the first attempt.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry.
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default ceiling for a single backoff delay.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Jitter multiplies the delay by a factor drawn from this range.
const JITTER_RANGE: std::ops::RangeInclusive<f64> = 0.5..=1.5;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt; total attempts is `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for the un-jittered delay.
    pub max_delay: Duration,
    /// Multiply each delay by a uniform factor in `[0.5, 1.5]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: true,
        }
    }
}

/// Backoff delay for a 0-based `attempt`.
///
/// `min(max_delay, base_delay * 2^attempt)`, then optionally multiplied by a
/// uniform factor in `[0.5, 1.5]`. Without jitter the result is
/// non-decreasing in `attempt` and never exceeds `max_delay`.
pub fn calculate_backoff_delay(
    attempt: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
) -> Duration {
    let capped = 2u32
        .checked_pow(attempt)
        .and_then(|multiplier| base_delay.checked_mul(multiplier))
        .map_or(max_delay, |delay| delay.min(max_delay));

    if jitter {
        let factor = rand::thread_rng().gen_range(JITTER_RANGE);
        capped.mul_f64(factor)
    } else {
        capped
    }
}

/// Per-call retry state. Created fresh for every call, never persisted.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub attempt: u32,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_enabled: bool,
    pub last_error_kind: Option<ErrorKind>,
}

impl RetryContext {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            attempt: 0,
            max_retries: config.max_retries,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            jitter_enabled: config.jitter,
            last_error_kind: None,
        }
    }

    /// Record `error` and decide whether to go again.
    ///
    /// Returns the delay to sleep before the next attempt, or `None` when
    /// the error should be returned to the caller.
    pub fn next_delay(&mut self, label: &str, error: &ResilienceError) -> Option<Duration> {
        self.last_error_kind = error.kind();

        match error.retry_class() {
            RetryClass::WithBackoff => {}
            class => {
                debug!(
                    "Retry: '{}' not retrying {:?} error: {}",
                    label, class, error
                );
                return None;
            }
        }

        if self.attempt >= self.max_retries {
            warn!(
                "Retry: '{}' giving up after {} attempt(s): {}",
                label,
                self.attempt + 1,
                error
            );
            return None;
        }

        let delay = calculate_backoff_delay(
            self.attempt,
            self.base_delay,
            self.max_delay,
            self.jitter_enabled,
        );
        self.attempt += 1;
        debug!(
            "Retry: '{}' attempt {}/{} in {:?} after {}",
            label, self.attempt, self.max_retries, delay, error
        );
        Some(delay)
    }
}

/// Runs an operation with bounded retries.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
    policy: ErrorPolicy,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig, policy: ErrorPolicy) -> Self {
        Self { config, policy }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn policy(&self) -> &ErrorPolicy {
        &self.policy
    }

    /// Fresh context for one call.
    pub fn context(&self) -> RetryContext {
        RetryContext::new(&self.config)
    }

    /// Retry an operation that already reports [`ResilienceError`]s.
    ///
    /// The sleep happens on the calling task only; no shared state is held
    /// across it.
    pub async fn retry_with_backoff<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let mut context = self.context();
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => match context.next_delay(label, &e) {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => return Err(e),
                },
            }
        }
    }

    /// Retry a raw provider call, classifying failures with this executor's
    /// policy.
    pub async fn retry_provider_call<T, F, Fut>(
        &self,
        provider: &str,
        mut op: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut context = self.context();
        loop {
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => ResilienceError::from_provider(provider, e, &self.policy),
            };
            match context.next_delay(provider, &error) {
                Some(delay) => tokio::time::sleep(delay).await,
                None => return Err(error),
            }
        }
    }
}
