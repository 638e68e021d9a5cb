//! Composed protection for outbound provider calls.
//!
//! Every attempt goes through the same gates, in order:
//! 1. Circuit breaker: fail fast if the provider's circuit is open
//! 2. Rate limiter: wait for a token, up to the configured maximum
//! 3. The call itself; the outcome is recorded on the circuit
//!
//! Failed attempts are retried with exponential backoff when the failure is
//! transient.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use super::{CircuitBreaker, RateLimitConfig, RateLimiter};
use crate::config::ResilienceSettings;
use crate::errors::{ProviderError, ResilienceError};
use crate::monitoring::MonitoringAggregator;
use crate::retry::RetryExecutor;

/// Default longest wait for a rate limit token.
const DEFAULT_MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(30);

/// Rate limiter, circuit breaker and retry policy shared by all providers.
pub struct ResilienceRegistry {
    rate_limiter: Arc<RateLimiter>,
    circuit_breaker: Arc<CircuitBreaker>,
    retry: RetryExecutor,
    max_rate_limit_wait: Duration,
}

impl ResilienceRegistry {
    /// Create a registry with default settings.
    pub fn new() -> Self {
        Self::with_components(
            RateLimiter::new(),
            CircuitBreaker::new(),
            RetryExecutor::default(),
            DEFAULT_MAX_RATE_LIMIT_WAIT,
        )
    }

    /// Create a registry from explicit components.
    pub fn with_components(
        rate_limiter: RateLimiter,
        circuit_breaker: CircuitBreaker,
        retry: RetryExecutor,
        max_rate_limit_wait: Duration,
    ) -> Self {
        Self {
            rate_limiter: Arc::new(rate_limiter),
            circuit_breaker: Arc::new(circuit_breaker),
            retry,
            max_rate_limit_wait,
        }
    }

    /// Build a registry from loaded settings.
    pub fn from_settings(settings: &ResilienceSettings) -> Self {
        let policy = settings.error_policy();
        let rate_limiter = RateLimiter::with_default(RateLimitConfig {
            requests_per_minute: settings.default_requests_per_minute,
        });
        for (provider, rpm) in &settings.rate_limits {
            rate_limiter.configure(
                provider,
                RateLimitConfig {
                    requests_per_minute: *rpm,
                },
            );
        }

        let circuit_breaker =
            CircuitBreaker::with_config(settings.circuit_breaker_config()).with_policy(policy.clone());
        let retry = RetryExecutor::new(settings.retry_config(), policy);

        info!(
            "Resilience: {} provider rate limit(s), default {} req/min",
            settings.rate_limits.len(),
            settings.default_requests_per_minute
        );

        Self::with_components(
            rate_limiter,
            circuit_breaker,
            retry,
            Duration::from_millis(settings.max_rate_limit_wait_ms),
        )
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    /// Monitoring view sharing this registry's state.
    pub fn monitoring(&self) -> MonitoringAggregator {
        MonitoringAggregator::new(self.rate_limiter.clone(), self.circuit_breaker.clone())
    }

    /// Protected call handle bound to one provider.
    pub fn rate_limited(&self, provider: impl Into<String>) -> RateLimited<'_> {
        RateLimited {
            registry: self,
            provider: provider.into(),
        }
    }

    /// Run `op` with circuit breaking, rate limiting and retries.
    ///
    /// If the circuit opens between retries, the failure that tripped it is
    /// returned rather than [`ResilienceError::CircuitOpen`].
    pub async fn call<T, F, Fut>(&self, provider: &str, op: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.call_gated(provider, || Ok(()), op).await
    }

    /// Like [`call`](Self::call), with `admit` checked on every attempt
    /// after the circuit and rate limit gates pass and right before `op`.
    ///
    /// An error from `admit` is returned as is, without calling `op` or
    /// touching the circuit. Use it to charge per-call allowances such as a
    /// daily quota.
    pub async fn call_gated<T, G, F, Fut>(
        &self,
        provider: &str,
        mut admit: G,
        mut op: F,
    ) -> Result<T, ResilienceError>
    where
        G: FnMut() -> Result<(), ResilienceError>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut context = self.retry.context();
        let mut previous: Option<ResilienceError> = None;
        loop {
            let error = match self.attempt(provider, &mut admit, &mut op).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if let (ResilienceError::CircuitOpen { .. }, Some(previous)) = (&error, previous.take()) {
                debug!(
                    "Resilience: circuit for '{}' opened during retries, returning last failure",
                    provider
                );
                return Err(previous);
            }

            match context.next_delay(provider, &error) {
                Some(delay) => {
                    previous = Some(error);
                    tokio::time::sleep(delay).await;
                }
                None => return Err(error),
            }
        }
    }

    /// Like [`call`](Self::call), but logs the failure and returns `fallback`.
    pub async fn call_or<T, F, Fut>(&self, provider: &str, fallback: T, op: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        match self.call(provider, op).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Resilience: '{}' failed, using fallback: {}", provider, e);
                fallback
            }
        }
    }

    /// One pass through the gates, without retries.
    async fn attempt<T, G, F, Fut>(
        &self,
        provider: &str,
        admit: &mut G,
        op: &mut F,
    ) -> Result<T, ResilienceError>
    where
        G: FnMut() -> Result<(), ResilienceError>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        if !self.circuit_breaker.is_allowed(provider) {
            return Err(ResilienceError::CircuitOpen {
                provider: provider.to_string(),
            });
        }

        self.rate_limiter
            .acquire(provider, self.max_rate_limit_wait)
            .await?;
        admit()?;

        let outcome = op().await;
        self.circuit_breaker.record_outcome(provider, outcome)
    }
}

impl Default for ResilienceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A registry bound to one provider.
pub struct RateLimited<'a> {
    registry: &'a ResilienceRegistry,
    provider: String,
}

impl RateLimited<'_> {
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.registry.call(&self.provider, op).await
    }

    pub async fn call_or<T, F, Fut>(&self, fallback: T, op: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.registry.call_or(&self.provider, fallback, op).await
    }
}
