//! Read-only views over the rate limiter and circuit breaker state.
//!
//! Snapshots are plain serializable structs so they can be handed to a
//! health endpoint or logged as JSON.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;
use crate::registry::{
    CircuitBreaker, CircuitMetrics, CircuitState, RateLimiter, RateLimiterMetrics,
};

/// Overall health score at or above which the system is healthy.
const HEALTHY_SCORE: f64 = 0.8;

/// Overall health score at or above which the system is degraded.
const DEGRADED_SCORE: f64 = 0.5;

/// Health of a single component or of the whole system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    /// Map a `[0, 1]` score onto a status.
    pub fn from_score(score: f64) -> Self {
        if score >= HEALTHY_SCORE {
            Self::Healthy
        } else if score >= DEGRADED_SCORE {
            Self::Degraded
        } else {
            Self::Critical
        }
    }

    fn weight(self) -> f64 {
        match self {
            Self::Healthy => 1.0,
            Self::Degraded => 0.7,
            Self::Critical => 0.4,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Aggregated health of all tracked providers.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Mean over providers of circuit availability times bucket health.
    pub health_score: f64,
    /// Providers whose circuit is not open.
    pub services_available: usize,
    pub services_total: usize,
    /// Providers whose circuit is open, sorted.
    pub unavailable: Vec<String>,
}

/// Full system snapshot.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub health: HealthReport,
    /// Requests seen by the rate limiter.
    pub total_requests: u64,
    /// Requests the rate limiter denied.
    pub denied_requests: u64,
    /// Failed provider calls recorded by the circuit breaker.
    pub total_failures: u64,
    /// Calls rejected by open circuits.
    pub rejected_requests: u64,
    /// Failure counts by kind, summed across providers.
    pub error_histogram: BTreeMap<ErrorKind, u64>,
    pub rate_limiters: Vec<RateLimiterMetrics>,
    pub circuit_breakers: Vec<CircuitMetrics>,
}

/// Monitoring facade over a shared rate limiter and circuit breaker.
#[derive(Clone)]
pub struct MonitoringAggregator {
    rate_limiter: Arc<RateLimiter>,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl MonitoringAggregator {
    pub fn new(rate_limiter: Arc<RateLimiter>, circuit_breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            rate_limiter,
            circuit_breaker,
        }
    }

    pub fn comprehensive_rate_limiter_stats(&self) -> Vec<RateLimiterMetrics> {
        self.rate_limiter.all_metrics()
    }

    pub fn comprehensive_circuit_breaker_stats(&self) -> Vec<CircuitMetrics> {
        self.circuit_breaker.metrics()
    }

    pub fn health_status(&self) -> HealthReport {
        Self::health_from(
            &self.comprehensive_rate_limiter_stats(),
            &self.comprehensive_circuit_breaker_stats(),
        )
    }

    fn health_from(buckets: &[RateLimiterMetrics], circuits: &[CircuitMetrics]) -> HealthReport {
        let providers: BTreeSet<&str> = buckets
            .iter()
            .map(|m| m.provider.as_str())
            .chain(circuits.iter().map(|m| m.provider.as_str()))
            .collect();

        if providers.is_empty() {
            return HealthReport {
                status: HealthStatus::Healthy,
                health_score: 1.0,
                services_available: 0,
                services_total: 0,
                unavailable: Vec::new(),
            };
        }

        let mut unavailable = Vec::new();
        let mut score_sum = 0.0;

        for provider in &providers {
            let circuit = circuits.iter().find(|m| m.provider == *provider);
            let bucket = buckets.iter().find(|m| m.provider == *provider);

            let circuit_score = match circuit.map(|m| m.state) {
                Some(CircuitState::Open) => {
                    unavailable.push(provider.to_string());
                    0.0
                }
                Some(CircuitState::HalfOpen) => 0.5,
                Some(CircuitState::Closed) | None => 1.0,
            };
            let bucket_score = bucket.map(|m| m.health_status.weight()).unwrap_or(1.0);

            score_sum += circuit_score * bucket_score;
        }

        let health_score = score_sum / providers.len() as f64;
        HealthReport {
            status: HealthStatus::from_score(health_score),
            health_score,
            services_available: providers.len() - unavailable.len(),
            services_total: providers.len(),
            unavailable,
        }
    }

    pub fn system_performance_report(&self) -> PerformanceReport {
        let rate_limiters = self.comprehensive_rate_limiter_stats();
        let circuit_breakers = self.comprehensive_circuit_breaker_stats();

        let mut error_histogram = BTreeMap::new();
        for metrics in &circuit_breakers {
            for (kind, count) in &metrics.error_histogram {
                *error_histogram.entry(*kind).or_insert(0) += count;
            }
        }

        PerformanceReport {
            generated_at: Utc::now(),
            health: Self::health_from(&rate_limiters, &circuit_breakers),
            total_requests: rate_limiters.iter().map(|m| m.total_requests).sum(),
            denied_requests: rate_limiters.iter().map(|m| m.denied_requests).sum(),
            total_failures: circuit_breakers.iter().map(|m| m.total_failures).sum(),
            rejected_requests: circuit_breakers.iter().map(|m| m.rejected_requests).sum(),
            error_histogram,
            rate_limiters,
            circuit_breakers,
        }
    }

    pub fn reset_circuit_breaker(&self, provider: &str) {
        self.circuit_breaker.reset(provider);
    }

    pub fn reset_all_circuit_breakers(&self) {
        info!("Monitoring: resetting all circuit breakers");
        self.circuit_breaker.reset_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CircuitBreakerConfig, RateLimitConfig};
    use std::time::Duration;

    fn aggregator() -> MonitoringAggregator {
        let breaker = CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: 1,
            minimum_calls: usize::MAX,
            recovery_timeout: Duration::from_secs(60),
            ..Default::default()
        });
        MonitoringAggregator::new(Arc::new(RateLimiter::new()), Arc::new(breaker))
    }

    #[test]
    fn test_from_score_thresholds() {
        assert_eq!(HealthStatus::from_score(1.0), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_score(0.8), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_score(0.79), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_score(0.5), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_score(0.49), HealthStatus::Critical);
    }

    #[test]
    fn test_empty_system_is_healthy() {
        let report = aggregator().health_status();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.services_total, 0);
    }

    #[test]
    fn test_open_circuit_lowers_health() {
        let monitoring = aggregator();
        monitoring.circuit_breaker.record_success("openai");
        monitoring
            .circuit_breaker
            .record_failure("anthropic", ErrorKind::ServerError);

        let report = monitoring.health_status();
        assert_eq!(report.services_total, 2);
        assert_eq!(report.services_available, 1);
        assert_eq!(report.unavailable, vec!["anthropic".to_string()]);
        assert!((report.health_score - 0.5).abs() < 1e-9);
        assert_eq!(report.status, HealthStatus::Degraded);

        monitoring.reset_circuit_breaker("anthropic");
        assert_eq!(monitoring.health_status().status, HealthStatus::Healthy);
    }

    #[test]
    fn test_performance_report_aggregates() {
        let monitoring = aggregator();
        monitoring
            .rate_limiter
            .configure("nominatim", RateLimitConfig { requests_per_minute: 1 });
        assert!(monitoring.rate_limiter.try_acquire("nominatim"));
        assert!(!monitoring.rate_limiter.try_acquire("nominatim"));

        monitoring
            .circuit_breaker
            .record_failure("a", ErrorKind::Timeout);
        monitoring
            .circuit_breaker
            .record_failure("b", ErrorKind::Timeout);

        let report = monitoring.system_performance_report();
        assert_eq!(report.total_requests, 2);
        assert_eq!(report.denied_requests, 1);
        assert_eq!(report.total_failures, 2);
        assert_eq!(report.error_histogram.get(&ErrorKind::Timeout), Some(&2));

        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("generatedAt").is_some());
        assert_eq!(json["health"]["servicesTotal"], 3);

        monitoring.reset_all_circuit_breakers();
        assert!(monitoring
            .comprehensive_circuit_breaker_stats()
            .iter()
            .all(|m| m.state == CircuitState::Closed));
    }
}
