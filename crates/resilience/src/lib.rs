//! Enrichment Resilience Crate
//!
//! This crate protects outbound calls to rate-limited, intermittently failing
//! third-party providers (LLM APIs, geocoders).
//!
//! # Overview
//!
//! The resilience crate supports:
//! - Per-provider token bucket rate limiting
//! - Per-provider circuit breaking with consecutive and windowed failure trips
//! - Error classification into a fixed taxonomy
//! - Bounded retries with exponential backoff and jitter
//! - Health and performance snapshots
//!
//! # Architecture
//!
//! ```text
//!                          +------------------+
//!                          |     Caller       |
//!                          +------------------+
//!                                  |
//!                                  v
//!                          +------------------+
//!                          |  RetryExecutor   |  (backoff on transient errors)
//!                          +------------------+
//!                                  |
//!                                  v
//!                          +------------------+
//!                          |  CircuitBreaker  |  (fail fast when open)
//!                          +------------------+
//!                                  |
//!                                  v
//!                          +------------------+
//!                          |   RateLimiter    |  (token bucket per provider)
//!                          +------------------+
//!                                  |
//!                                  v
//!                          +------------------+
//!                          |  Provider call   |  (ProviderError on failure)
//!                          +------------------+
//! ```
//!
//! # Core Types
//!
//! - [`ResilienceRegistry`] - Composes all layers for a named provider
//! - [`ResilienceError`] - Errors surfaced to callers, with a [`RetryClass`]
//! - [`ErrorKind`] - Failure taxonomy produced by [`ErrorClassifier`]
//! - [`ResilienceSettings`] - Configuration from the environment or JSON
//! - [`MonitoringAggregator`] - Health and performance snapshots

pub mod config;
pub mod errors;
pub mod monitoring;
pub mod registry;
pub mod retry;

pub use config::{CircuitBreakerSettings, ResilienceSettings, RetrySettings};
pub use errors::{
    ErrorClassifier, ErrorKind, ErrorPolicy, ProviderError, ResilienceError, RetryClass,
};
pub use monitoring::{HealthReport, HealthStatus, MonitoringAggregator, PerformanceReport};
pub use registry::{
    CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitState, RateLimitConfig,
    RateLimited, RateLimiter, RateLimiterMetrics, ResilienceRegistry, TokenBucket,
};
pub use retry::{calculate_backoff_delay, RetryConfig, RetryContext, RetryExecutor};
