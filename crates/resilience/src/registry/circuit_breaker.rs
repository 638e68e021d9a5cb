//! Per-provider circuit breaker for fault tolerance.
//!
//! Implements the circuit breaker pattern to stop calling a provider that is
//! failing. The circuit has three states:
//!
//! - **Closed**: Normal operation, requests are allowed through.
//! - **Open**: Provider is failing, requests are rejected without a call.
//! - **HalfOpen**: Recovery timeout elapsed; the next outcome decides.
//!
//! Failures are counted both as a consecutive streak and over a sliding
//! window of recent outcomes. Either can trip the circuit.
//!
//! The circuit breaker is in-memory and resets on process restart.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Serialize;

use crate::errors::{ErrorKind, ErrorPolicy, ProviderError, ResilienceError};
use crate::monitoring::HealthStatus;

/// Default number of consecutive failures before opening the circuit.
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default failure rate over the window that opens the circuit.
const DEFAULT_FAILURE_RATE_THRESHOLD: f64 = 0.5;

/// Default number of outcomes kept in the sliding window.
const DEFAULT_WINDOW_SIZE: usize = 20;

/// Outcomes required in the window before the failure rate is trusted.
const DEFAULT_MINIMUM_CALLS: usize = 10;

/// Default time to wait before transitioning from Open to HalfOpen.
const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Circuit breaker state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - requests are allowed.
    Closed,
    /// Provider is failing - requests are blocked.
    Open,
    /// Testing recovery - the next outcome decides.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Failure rate (0.0-1.0) over the window that opens the circuit.
    pub failure_rate_threshold: f64,
    /// Number of recent outcomes in the sliding window.
    pub window_size: usize,
    /// Minimum outcomes in the window before the rate check applies.
    pub minimum_calls: usize,
    /// Time to wait in Open before testing recovery.
    pub recovery_timeout: Duration,
    /// Whether permanent kinds (auth/client errors) may open a closed
    /// circuit. They are always recorded in the histogram, and any failure
    /// re-opens a half-open circuit.
    pub permanent_errors_trip: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            failure_rate_threshold: DEFAULT_FAILURE_RATE_THRESHOLD,
            window_size: DEFAULT_WINDOW_SIZE,
            minimum_calls: DEFAULT_MINIMUM_CALLS,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            permanent_errors_trip: true,
        }
    }
}

/// Internal circuit state for a single provider.
#[derive(Debug)]
struct Circuit {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    /// Recent outcomes; `true` is a failure.
    window: VecDeque<bool>,
    last_failure_time: Option<Instant>,
    last_transition_time: Instant,
    error_histogram: HashMap<ErrorKind, u64>,
    total_requests: u64,
    total_failures: u64,
    rejected_requests: u64,
    circuit_open_count: u64,
}

impl Circuit {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window_size),
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_time: None,
            last_transition_time: Instant::now(),
            error_histogram: HashMap::new(),
            total_requests: 0,
            total_failures: 0,
            rejected_requests: 0,
            circuit_open_count: 0,
        }
    }

    fn transition(&mut self, provider: &str, to: CircuitState) {
        info!(
            "Circuit breaker: '{}' {} -> {}",
            provider, self.state, to
        );
        self.state = to;
        self.last_transition_time = Instant::now();

        match to {
            CircuitState::Open => self.circuit_open_count += 1,
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.window.clear();
            }
            CircuitState::HalfOpen => {}
        }
    }

    fn push_outcome(&mut self, failed: bool) {
        if self.config.window_size == 0 {
            return;
        }
        if self.window.len() == self.config.window_size {
            self.window.pop_front();
        }
        self.window.push_back(failed);
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|failed| **failed).count();
        failures as f64 / self.window.len() as f64
    }

    fn rate_tripped(&self) -> bool {
        self.window.len() >= self.config.minimum_calls.max(1)
            && self.failure_rate() > self.config.failure_rate_threshold
    }

    fn health_status(&self) -> HealthStatus {
        match self.state {
            CircuitState::Open => HealthStatus::Critical,
            CircuitState::HalfOpen => HealthStatus::Degraded,
            CircuitState::Closed => {
                if self.failure_rate() >= self.config.failure_rate_threshold / 2.0 {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                }
            }
        }
    }

    fn reset(&mut self) {
        *self = Circuit::new(self.config.clone());
    }
}

/// Per-provider circuit breaker.
///
/// Each provider's circuit sits behind its own lock. State is in-memory and
/// resets when the process restarts.
pub struct CircuitBreaker {
    circuits: DashMap<String, Arc<Mutex<Circuit>>>,
    configs: DashMap<String, CircuitBreakerConfig>,
    default_config: CircuitBreakerConfig,
    policy: ErrorPolicy,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with default settings.
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    /// Create a circuit breaker with custom configuration.
    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: DashMap::new(),
            configs: DashMap::new(),
            default_config: config,
            policy: ErrorPolicy::default(),
        }
    }

    /// Use `policy` to decide which kinds are permanent.
    pub fn with_policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override the configuration for one provider. Resets its circuit.
    pub fn configure(&self, provider: &str, config: CircuitBreakerConfig) {
        self.configs.insert(provider.to_string(), config);
        self.circuits.remove(provider);
    }

    /// Lock a circuit, recovering from poison if necessary.
    fn lock(circuit: &Mutex<Circuit>) -> MutexGuard<'_, Circuit> {
        circuit.lock().unwrap_or_else(|poisoned| {
            warn!("Circuit breaker mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn circuit(&self, provider: &str) -> Arc<Mutex<Circuit>> {
        if let Some(circuit) = self.circuits.get(provider) {
            return circuit.clone();
        }
        self.circuits
            .entry(provider.to_string())
            .or_insert_with(|| {
                let config = self
                    .configs
                    .get(provider)
                    .map(|c| c.clone())
                    .unwrap_or_else(|| self.default_config.clone());
                Arc::new(Mutex::new(Circuit::new(config)))
            })
            .clone()
    }

    /// Check if requests are allowed for a provider.
    ///
    /// Returns false only while the circuit is Open and the recovery timeout
    /// has not elapsed. Once it has, the circuit moves to HalfOpen and the
    /// request is let through.
    pub fn is_allowed(&self, provider: &str) -> bool {
        let circuit = self.circuit(provider);
        let mut circuit = Self::lock(&circuit);

        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if circuit.last_transition_time.elapsed() >= circuit.config.recovery_timeout {
                    circuit.transition(provider, CircuitState::HalfOpen);
                    true
                } else {
                    circuit.rejected_requests += 1;
                    false
                }
            }
        }
    }

    /// Record a successful request for a provider.
    pub fn record_success(&self, provider: &str) {
        let circuit = self.circuit(provider);
        let mut circuit = Self::lock(&circuit);

        circuit.total_requests += 1;
        circuit.push_outcome(false);

        match circuit.state {
            CircuitState::Closed => {
                circuit.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                circuit.transition(provider, CircuitState::Closed);
            }
            CircuitState::Open => {
                // A call admitted before the circuit opened finished late.
                debug!(
                    "Circuit breaker: late success for '{}' while Open",
                    provider
                );
            }
        }
    }

    /// Record a failed request for a provider.
    ///
    /// The kind always lands in the histogram. Whether it counts toward
    /// opening the circuit depends on `permanent_errors_trip`.
    pub fn record_failure(&self, provider: &str, kind: ErrorKind) {
        let circuit = self.circuit(provider);
        let mut circuit = Self::lock(&circuit);

        circuit.total_requests += 1;
        circuit.total_failures += 1;
        circuit.last_failure_time = Some(Instant::now());
        *circuit.error_histogram.entry(kind).or_insert(0) += 1;

        let trips = circuit.config.permanent_errors_trip || !self.policy.is_permanent(kind);
        if !trips {
            if circuit.state == CircuitState::HalfOpen {
                warn!(
                    "Circuit breaker: trial call for '{}' failed with {}, re-opening",
                    provider, kind
                );
                circuit.transition(provider, CircuitState::Open);
                return;
            }
            debug!(
                "Circuit breaker: '{}' failed with permanent {}, not counted toward opening",
                provider, kind
            );
            return;
        }

        circuit.consecutive_failures += 1;
        circuit.push_outcome(true);

        match circuit.state {
            CircuitState::Closed => {
                if circuit.consecutive_failures >= circuit.config.failure_threshold
                    || circuit.rate_tripped()
                {
                    warn!(
                        "Circuit breaker: opening circuit for '{}' ({} consecutive, {:.0}% failure rate)",
                        provider,
                        circuit.consecutive_failures,
                        circuit.failure_rate() * 100.0
                    );
                    circuit.transition(provider, CircuitState::Open);
                } else {
                    debug!(
                        "Circuit breaker: {} failure for '{}' ({}/{})",
                        kind, provider, circuit.consecutive_failures, circuit.config.failure_threshold
                    );
                }
            }
            CircuitState::HalfOpen => {
                circuit.transition(provider, CircuitState::Open);
            }
            CircuitState::Open => {
                debug!(
                    "Circuit breaker: additional failure for '{}' (already open)",
                    provider
                );
            }
        }
    }

    /// Run `op` through the circuit.
    ///
    /// Fails with [`ResilienceError::CircuitOpen`] without invoking `op` when
    /// the circuit is open. Otherwise classifies the outcome and updates the
    /// circuit.
    pub async fn call<T, F, Fut>(&self, provider: &str, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        if !self.is_allowed(provider) {
            return Err(ResilienceError::CircuitOpen {
                provider: provider.to_string(),
            });
        }

        let outcome = op().await;
        self.record_outcome(provider, outcome)
    }

    /// Record the outcome of a call admitted by [`is_allowed`](Self::is_allowed)
    /// and convert a failure into a classified [`ResilienceError`].
    pub fn record_outcome<T>(
        &self,
        provider: &str,
        outcome: Result<T, ProviderError>,
    ) -> Result<T, ResilienceError> {
        match outcome {
            Ok(value) => {
                self.record_success(provider);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(provider, e.kind());
                Err(ResilienceError::from_provider(provider, e, &self.policy))
            }
        }
    }

    pub fn policy(&self) -> &ErrorPolicy {
        &self.policy
    }

    /// Get the current state for a provider.
    pub fn state(&self, provider: &str) -> CircuitState {
        self.circuits
            .get(provider)
            .map(|c| {
                let circuit = Self::lock(&c);
                circuit.state
            })
            .unwrap_or(CircuitState::Closed)
    }

    /// Get the consecutive failure count for a provider.
    pub fn failure_count(&self, provider: &str) -> u32 {
        self.circuits
            .get(provider)
            .map(|c| {
                let circuit = Self::lock(&c);
                circuit.consecutive_failures
            })
            .unwrap_or(0)
    }

    /// Reset the circuit for a provider to Closed state.
    pub fn reset(&self, provider: &str) {
        if let Some(circuit) = self.circuits.get(provider) {
            info!(
                "Circuit breaker: manually resetting circuit for '{}'",
                provider
            );
            Self::lock(&circuit).reset();
        }
    }

    /// Reset all circuits to their initial state.
    pub fn reset_all(&self) {
        for entry in self.circuits.iter() {
            Self::lock(entry.value()).reset();
        }
        info!("Circuit breaker: all circuits reset");
    }

    /// Metrics for one provider, if its circuit exists.
    pub fn metrics_for(&self, provider: &str) -> Option<CircuitMetrics> {
        let circuit = self.circuits.get(provider)?.clone();
        let circuit = Self::lock(&circuit);
        Some(CircuitMetrics::from_circuit(provider, &circuit))
    }

    /// Get metrics for all tracked providers, sorted by provider name.
    pub fn metrics(&self) -> Vec<CircuitMetrics> {
        let circuits: Vec<(String, Arc<Mutex<Circuit>>)> = self
            .circuits
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut metrics: Vec<_> = circuits
            .iter()
            .map(|(provider, circuit)| CircuitMetrics::from_circuit(provider, &Self::lock(circuit)))
            .collect();
        metrics.sort_by(|a, b| a.provider.cmp(&b.provider));
        metrics
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics for a single circuit.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitMetrics {
    pub provider: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Failure rate over the sliding window.
    pub failure_rate: f64,
    pub total_requests: u64,
    pub total_failures: u64,
    /// Calls rejected while Open.
    pub rejected_requests: u64,
    pub circuit_open_count: u64,
    pub error_histogram: BTreeMap<ErrorKind, u64>,
    pub seconds_since_last_failure: Option<f64>,
    pub seconds_in_state: f64,
    pub health_status: HealthStatus,
}

impl CircuitMetrics {
    fn from_circuit(provider: &str, circuit: &Circuit) -> Self {
        Self {
            provider: provider.to_string(),
            state: circuit.state,
            consecutive_failures: circuit.consecutive_failures,
            failure_rate: circuit.failure_rate(),
            total_requests: circuit.total_requests,
            total_failures: circuit.total_failures,
            rejected_requests: circuit.rejected_requests,
            circuit_open_count: circuit.circuit_open_count,
            error_histogram: circuit
                .error_histogram
                .iter()
                .map(|(kind, count)| (*kind, *count))
                .collect(),
            seconds_since_last_failure: circuit
                .last_failure_time
                .map(|t| t.elapsed().as_secs_f64()),
            seconds_in_state: circuit.last_transition_time.elapsed().as_secs_f64(),
            health_status: circuit.health_status(),
        }
    }
}
