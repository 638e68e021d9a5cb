//! Token bucket rate limiter for enrichment providers.
//!
//! Implements per-provider rate limiting using the token bucket algorithm.
//! Each provider gets its own bucket behind its own lock, so a busy provider
//! never blocks callers of an unrelated one.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{debug, warn};
use serde::Serialize;

use crate::errors::ResilienceError;
use crate::monitoring::HealthStatus;

/// Default rate limit: 60 requests per minute.
const DEFAULT_REQUESTS_PER_MINUTE: u32 = 60;

/// Number of recent admission decisions used for the health label.
const RECENT_WINDOW: usize = 50;

/// Recent denial rate above which a bucket is `Degraded`.
const DEGRADED_DENIAL_RATE: f64 = 0.1;

/// Recent denial rate above which a bucket is `Critical`.
const CRITICAL_DENIAL_RATE: f64 = 0.3;

/// Token bucket for a single provider.
///
/// `capacity` is expressed in tokens per minute and is also the burst
/// ceiling. `tokens` never leaves `[0, capacity]`.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
    total_requests: u64,
    denied_requests: u64,
    violation_count: u64,
    /// `true` for admitted, `false` for denied.
    recent: VecDeque<bool>,
}

impl TokenBucket {
    /// Create a full bucket refilling at `requests_per_minute`.
    pub fn new(requests_per_minute: u32) -> Self {
        let capacity = f64::from(requests_per_minute.max(1));
        Self {
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
            total_requests: 0,
            denied_requests: 0,
            violation_count: 0,
            recent: VecDeque::with_capacity(RECENT_WINDOW),
        }
    }

    /// Try to take `tokens` from the bucket. Never blocks.
    pub fn consume(&mut self, tokens: u32) -> bool {
        self.consume_at(tokens, Instant::now())
    }

    fn consume_at(&mut self, tokens: u32, now: Instant) -> bool {
        self.refill_at(now);
        self.total_requests += 1;

        let requested = f64::from(tokens);
        let admitted = self.tokens >= requested;
        if admitted {
            self.tokens -= requested;
        } else {
            self.denied_requests += 1;
            self.violation_count += 1;
        }

        if self.recent.len() == RECENT_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(admitted);
        admitted
    }

    /// Refill tokens based on elapsed time.
    ///
    /// Elapsed time is clamped at zero, so an instant earlier than the last
    /// refill can never remove tokens.
    fn refill_at(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let refill = elapsed * (self.capacity / 60.0);

        self.tokens = (self.tokens + refill).min(self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Time until `tokens` could be consumed. Zero if available now.
    pub fn time_until_available(&mut self, tokens: u32) -> Duration {
        self.refill_at(Instant::now());

        let requested = f64::from(tokens);
        if self.tokens >= requested {
            return Duration::ZERO;
        }
        if requested > self.capacity {
            // Never satisfiable; report a full refill period.
            return Duration::from_secs(60);
        }
        let seconds_needed = (requested - self.tokens) / (self.capacity / 60.0);
        Duration::from_secs_f64(seconds_needed)
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    pub fn denied_requests(&self) -> u64 {
        self.denied_requests
    }

    fn recent_denial_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let denied = self.recent.iter().filter(|admitted| !**admitted).count();
        denied as f64 / self.recent.len() as f64
    }

    fn health_status(&self) -> HealthStatus {
        let denial_rate = self.recent_denial_rate();
        if denial_rate > CRITICAL_DENIAL_RATE {
            HealthStatus::Critical
        } else if denial_rate > DEGRADED_DENIAL_RATE {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Snapshot of this bucket.
    pub fn metrics(&mut self, provider: &str) -> RateLimiterMetrics {
        self.refill_at(Instant::now());

        let success_rate = if self.total_requests == 0 {
            1.0
        } else {
            (self.total_requests - self.denied_requests) as f64 / self.total_requests as f64
        };

        RateLimiterMetrics {
            provider: provider.to_string(),
            capacity: self.capacity,
            tokens: self.tokens,
            total_requests: self.total_requests,
            denied_requests: self.denied_requests,
            violation_count: self.violation_count,
            utilization: 1.0 - self.tokens / self.capacity,
            success_rate,
            health_status: self.health_status(),
        }
    }
}

/// Metrics for a single provider bucket.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterMetrics {
    pub provider: String,
    pub capacity: f64,
    pub tokens: f64,
    pub total_requests: u64,
    pub denied_requests: u64,
    pub violation_count: u64,
    /// `1 - tokens / capacity`
    pub utilization: f64,
    pub success_rate: f64,
    pub health_status: HealthStatus,
}

/// Rate limiter configuration for a provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Bucket capacity and refill rate, in requests per minute.
    pub requests_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
        }
    }
}

/// Token bucket rate limiter for multiple providers.
///
/// Buckets are created on demand with the default configuration, or can be
/// pre-configured per provider. Each bucket has its own lock.
pub struct RateLimiter {
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
    configs: DashMap<String, RateLimitConfig>,
    default_config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a new rate limiter with default settings.
    pub fn new() -> Self {
        Self::with_default(RateLimitConfig::default())
    }

    /// Create a rate limiter whose unconfigured providers use `config`.
    pub fn with_default(config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            configs: DashMap::new(),
            default_config: config,
        }
    }

    /// Lock a bucket, recovering from poison if necessary.
    ///
    /// The worst case after a poisoned lock is slightly off rate limiting,
    /// which is better than panicking in the caller.
    fn lock(bucket: &Mutex<TokenBucket>) -> MutexGuard<'_, TokenBucket> {
        bucket.lock().unwrap_or_else(|poisoned| {
            warn!("Rate limiter bucket mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Configure rate limits for a specific provider. Replaces any existing
    /// bucket so the new limit applies immediately.
    pub fn configure(&self, provider: &str, config: RateLimitConfig) {
        debug!(
            "Rate limiter: configuring '{}' at {} req/min",
            provider, config.requests_per_minute
        );
        self.configs.insert(provider.to_string(), config);
        self.buckets.remove(provider);
    }

    /// Bucket for `provider`, created on first use.
    fn bucket(&self, provider: &str) -> Arc<Mutex<TokenBucket>> {
        if let Some(bucket) = self.buckets.get(provider) {
            return bucket.clone();
        }
        self.buckets
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(self.create_bucket(provider))))
            .clone()
    }

    /// Create a bucket for a provider, using custom config if available.
    fn create_bucket(&self, provider: &str) -> TokenBucket {
        let rpm = self
            .configs
            .get(provider)
            .map(|c| c.requests_per_minute)
            .unwrap_or(self.default_config.requests_per_minute);
        TokenBucket::new(rpm)
    }

    /// Try to take `tokens` for the provider without waiting.
    pub fn consume(&self, provider: &str, tokens: u32) -> bool {
        let bucket = self.bucket(provider);
        let admitted = Self::lock(&bucket).consume(tokens);
        if !admitted {
            debug!("Rate limiter: denied {} token(s) for '{}'", tokens, provider);
        }
        admitted
    }

    /// Try to acquire a single token without waiting.
    pub fn try_acquire(&self, provider: &str) -> bool {
        self.consume(provider, 1)
    }

    /// Acquire a token, sleeping until one is available.
    ///
    /// Gives up with [`ResilienceError::RateLimitExceeded`] once the total
    /// wait would exceed `max_wait`. A zero `max_wait` means "don't wait".
    pub async fn acquire(&self, provider: &str, max_wait: Duration) -> Result<(), ResilienceError> {
        let bucket = self.bucket(provider);
        let mut waited = Duration::ZERO;

        loop {
            let wait_time = {
                let mut guard = Self::lock(&bucket);
                if guard.consume(1) {
                    return Ok(());
                }
                guard.time_until_available(1)
            };

            if waited + wait_time > max_wait {
                warn!(
                    "Rate limiter: '{}' needs {:?} more, exceeding max wait {:?}",
                    provider, wait_time, max_wait
                );
                return Err(ResilienceError::RateLimitExceeded {
                    provider: provider.to_string(),
                });
            }

            debug!(
                "Rate limiter: waiting {:?} for provider '{}'",
                wait_time, provider
            );
            tokio::time::sleep(wait_time).await;
            waited += wait_time;
        }
    }

    /// How long until `tokens` could be taken for the provider.
    pub fn time_until_available(&self, provider: &str, tokens: u32) -> Duration {
        let bucket = self.bucket(provider);
        let mut guard = Self::lock(&bucket);
        guard.time_until_available(tokens)
    }

    /// Get the remaining tokens for a provider.
    pub fn remaining_tokens(&self, provider: &str) -> f64 {
        let bucket = self.bucket(provider);
        let mut guard = Self::lock(&bucket);
        guard.refill_at(Instant::now());
        guard.tokens
    }

    /// Reset the rate limiter for a provider.
    pub fn reset(&self, provider: &str) {
        self.buckets.remove(provider);
    }

    /// Metrics for one provider, if its bucket exists.
    pub fn metrics(&self, provider: &str) -> Option<RateLimiterMetrics> {
        let bucket = self.buckets.get(provider)?.clone();
        let mut guard = Self::lock(&bucket);
        Some(guard.metrics(provider))
    }

    /// Metrics for every tracked provider, sorted by provider name.
    pub fn all_metrics(&self) -> Vec<RateLimiterMetrics> {
        let buckets: Vec<(String, Arc<Mutex<TokenBucket>>)> = self
            .buckets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut metrics: Vec<_> = buckets
            .iter()
            .map(|(provider, bucket)| Self::lock(bucket).metrics(provider))
            .collect();
        metrics.sort_by(|a, b| a.provider.cmp(&b.provider));
        metrics
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
