//! Provider protection registry.
//!
//! This module provides:
//! - Token bucket rate limiting per provider
//! - Circuit breaking for fault tolerance
//! - [`ResilienceRegistry`], which composes both with retries

mod circuit_breaker;
mod rate_limiter;
mod registry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitState};
pub use rate_limiter::{RateLimitConfig, RateLimiter, RateLimiterMetrics, TokenBucket};
pub use registry::{RateLimited, ResilienceRegistry};
