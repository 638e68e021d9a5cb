//! Settings for the resilience layer, loaded from the environment or JSON.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use log::warn;
use serde::Deserialize;

use crate::errors::{ErrorKind, ErrorPolicy};
use crate::registry::CircuitBreakerConfig;
use crate::retry::RetryConfig;

/// Circuit breaker settings in serializable units.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub failure_rate_threshold: f64,
    pub window_size: usize,
    pub minimum_calls: usize,
    pub recovery_timeout_secs: u64,
    pub permanent_errors_trip: bool,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let config = CircuitBreakerConfig::default();
        Self {
            failure_threshold: config.failure_threshold,
            failure_rate_threshold: config.failure_rate_threshold,
            window_size: config.window_size,
            minimum_calls: config.minimum_calls,
            recovery_timeout_secs: config.recovery_timeout.as_secs(),
            permanent_errors_trip: config.permanent_errors_trip,
        }
    }
}

/// Retry settings in serializable units.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let config = RetryConfig::default();
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.base_delay.as_millis() as u64,
            max_delay_ms: config.max_delay.as_millis() as u64,
            jitter: config.jitter,
        }
    }
}

/// Everything needed to build a
/// [`ResilienceRegistry`](crate::registry::ResilienceRegistry).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResilienceSettings {
    /// Requests per minute, keyed by provider name.
    pub rate_limits: BTreeMap<String, u32>,
    /// Requests per minute for providers without an entry.
    pub default_requests_per_minute: u32,
    /// Longest wait for a rate limit token before failing.
    pub max_rate_limit_wait_ms: u64,
    pub circuit_breaker: CircuitBreakerSettings,
    pub retry: RetrySettings,
    /// Kinds that are never retried.
    pub non_retryable: Vec<ErrorKind>,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            rate_limits: BTreeMap::new(),
            default_requests_per_minute: 60,
            max_rate_limit_wait_ms: 30_000,
            circuit_breaker: CircuitBreakerSettings::default(),
            retry: RetrySettings::default(),
            non_retryable: ErrorPolicy::default().permanent_kinds(),
        }
    }
}

impl ResilienceSettings {
    /// Load from `.env` and `ENRICH_*` environment variables.
    ///
    /// Unset or unparsable values fall back to defaults.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup, using the `ENRICH_*` variable names.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let cb = &defaults.circuit_breaker;
        let retry = &defaults.retry;

        let rate_limits = lookup("ENRICH_RATE_LIMITS")
            .map(|raw| parse_rate_limits(&raw))
            .unwrap_or_default();

        let non_retryable = match lookup("ENRICH_NON_RETRYABLE") {
            Some(raw) => parse_kinds(&raw),
            None => defaults.non_retryable.clone(),
        };

        Self {
            rate_limits,
            default_requests_per_minute: parse_or(
                &lookup,
                "ENRICH_DEFAULT_RPM",
                defaults.default_requests_per_minute,
            ),
            max_rate_limit_wait_ms: parse_or(
                &lookup,
                "ENRICH_RATE_LIMIT_MAX_WAIT_MS",
                defaults.max_rate_limit_wait_ms,
            ),
            circuit_breaker: CircuitBreakerSettings {
                failure_threshold: parse_or(
                    &lookup,
                    "ENRICH_CB_FAILURE_THRESHOLD",
                    cb.failure_threshold,
                ),
                failure_rate_threshold: parse_or(
                    &lookup,
                    "ENRICH_CB_FAILURE_RATE",
                    cb.failure_rate_threshold,
                ),
                window_size: parse_or(&lookup, "ENRICH_CB_WINDOW_SIZE", cb.window_size),
                minimum_calls: parse_or(&lookup, "ENRICH_CB_MIN_CALLS", cb.minimum_calls),
                recovery_timeout_secs: parse_or(
                    &lookup,
                    "ENRICH_CB_RECOVERY_SECS",
                    cb.recovery_timeout_secs,
                ),
                permanent_errors_trip: parse_or(
                    &lookup,
                    "ENRICH_CB_PERMANENT_TRIPS",
                    cb.permanent_errors_trip,
                ),
            },
            retry: RetrySettings {
                max_retries: parse_or(&lookup, "ENRICH_RETRY_MAX", retry.max_retries),
                base_delay_ms: parse_or(&lookup, "ENRICH_RETRY_BASE_MS", retry.base_delay_ms),
                max_delay_ms: parse_or(&lookup, "ENRICH_RETRY_MAX_MS", retry.max_delay_ms),
                jitter: parse_or(&lookup, "ENRICH_RETRY_JITTER", retry.jitter),
            },
            non_retryable,
        }
    }

    /// Parse settings from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        let cb = &self.circuit_breaker;
        CircuitBreakerConfig {
            failure_threshold: cb.failure_threshold.max(1),
            failure_rate_threshold: cb.failure_rate_threshold.clamp(0.0, 1.0),
            window_size: cb.window_size,
            minimum_calls: cb.minimum_calls,
            recovery_timeout: Duration::from_secs(cb.recovery_timeout_secs),
            permanent_errors_trip: cb.permanent_errors_trip,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: self.retry.jitter,
        }
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        ErrorPolicy::with_permanent(self.non_retryable.iter().copied())
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Config: invalid value '{}' for {}, using default", raw, key);
            default
        }),
        None => default,
    }
}

/// Parse `provider=rpm,provider=rpm`. Malformed entries are skipped.
fn parse_rate_limits(raw: &str) -> BTreeMap<String, u32> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let parsed = entry
                .split_once('=')
                .and_then(|(name, rpm)| Some((name.trim(), rpm.trim().parse::<u32>().ok()?)))
                .filter(|(name, rpm)| !name.is_empty() && *rpm > 0);
            if parsed.is_none() {
                warn!("Config: skipping malformed rate limit entry '{}'", entry);
            }
            parsed.map(|(name, rpm)| (name.to_string(), rpm))
        })
        .collect()
}

fn parse_kinds(raw: &str) -> Vec<ErrorKind> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<ErrorKind>() {
            Ok(kind) => Some(kind),
            Err(_) => {
                warn!("Config: unknown error kind '{}'", s);
                None
            }
        })
        .collect()
}
