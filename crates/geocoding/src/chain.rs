//! Multi-step lookup under a single time budget.
//!
//! Steps run in order (typically cache, primary geocoder, fallback
//! geocoder). Each gets `min(step timeout, remaining budget)`; the first
//! step that finds a result wins. A failing step never fails the chain: it is
//! recorded and the next step runs. When the budget is gone the remaining
//! steps are skipped and the chain returns no result.
//!
//! Steps execute on spawned tasks gated by a small worker pool. A step that
//! overruns is abandoned: its cancellation token fires, but a step that
//! ignores the token keeps running detached and its late result is
//! discarded. Step operations must therefore be idempotent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use enrichment_resilience::{ResilienceError, RetryClass};
use log::{debug, warn};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::models::{Coordinates, GeocodeRequest};
use crate::scheduler::RetryReason;

/// Default budget for the whole chain.
pub const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of steps that may run at once across all chain runs.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 4;

/// One step of the fallback chain.
#[async_trait]
pub trait FallbackStep: Send + Sync {
    /// Name used in diagnostics and logs.
    fn name(&self) -> &str;

    /// Soft timeout for this step, before clamping to the remaining budget.
    fn timeout(&self) -> Duration;

    /// Try to resolve `request`. `Ok(None)` declines without error.
    async fn run(
        &self,
        request: Arc<GeocodeRequest>,
        cancel: CancellationToken,
    ) -> Result<Option<Coordinates>, ResilienceError>;
}

/// Why a step did not run or was not counted as a call.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum SkipReason {
    /// The chain budget ran out before this step.
    BudgetExhausted,

    /// The step's provider is out of quota until `reset_at`.
    #[serde(rename_all = "camelCase")]
    QuotaExhausted { reset_at: DateTime<Utc> },

    /// Circuit breaker is open for the step's provider.
    CircuitOpen,

    /// Rate limiter blocked.
    RateLimited,
}

/// What happened to one step.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum StepOutcome {
    Success,
    /// Ran and found nothing.
    Declined,
    Error {
        message: String,
        retryable: bool,
    },
    #[serde(rename_all = "camelCase")]
    TimedOut {
        timeout_ms: u64,
    },
    Skipped(SkipReason),
}

impl StepOutcome {
    fn from_error(error: ResilienceError, effective: Duration) -> Self {
        match error {
            ResilienceError::CircuitOpen { .. } => Self::Skipped(SkipReason::CircuitOpen),
            ResilienceError::RateLimitExceeded { .. } => Self::Skipped(SkipReason::RateLimited),
            ResilienceError::QuotaExhausted { reset_at, .. } => {
                Self::Skipped(SkipReason::QuotaExhausted { reset_at })
            }
            ResilienceError::StepTimeout { .. } | ResilienceError::TotalTimeoutExceeded { .. } => {
                Self::TimedOut {
                    timeout_ms: effective.as_millis() as u64,
                }
            }
            other => Self::Error {
                retryable: other.retry_class() != RetryClass::Never,
                message: other.to_string(),
            },
        }
    }
}

/// Record of a single step during a chain run.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepAttempt {
    pub step: String,
    pub outcome: StepOutcome,
    pub elapsed_ms: u64,
}

/// Per-run trace of every step.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainDiagnostics {
    pub attempts: Vec<StepAttempt>,
}

impl ChainDiagnostics {
    pub fn new() -> Self {
        Self {
            attempts: Vec::new(),
        }
    }

    pub fn record(&mut self, step: &str, outcome: StepOutcome, elapsed: Duration) {
        self.attempts.push(StepAttempt {
            step: step.to_string(),
            outcome,
            elapsed_ms: elapsed.as_millis() as u64,
        });
    }

    pub fn record_skip(&mut self, step: &str, reason: SkipReason) {
        self.record(step, StepOutcome::Skipped(reason), Duration::ZERO);
    }

    /// Summary for logging/debugging.
    pub fn summary(&self) -> String {
        self.attempts
            .iter()
            .map(|a| match &a.outcome {
                StepOutcome::Success => format!("{}: SUCCESS", a.step),
                StepOutcome::Declined => format!("{}: DECLINED", a.step),
                StepOutcome::Error { message, .. } => format!("{}: ERROR ({})", a.step, message),
                StepOutcome::TimedOut { timeout_ms } => {
                    format!("{}: TIMEOUT ({}ms)", a.step, timeout_ms)
                }
                StepOutcome::Skipped(reason) => format!("{}: SKIPPED ({:?})", a.step, reason),
            })
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    pub fn has_success(&self) -> bool {
        self.attempts
            .iter()
            .any(|a| a.outcome == StepOutcome::Success)
    }

    /// Get all skip reasons.
    pub fn skip_reasons(&self) -> Vec<(&str, &SkipReason)> {
        self.attempts
            .iter()
            .filter_map(|a| match &a.outcome {
                StepOutcome::Skipped(reason) => Some((a.step.as_str(), reason)),
                _ => None,
            })
            .collect()
    }

    /// Earliest quota reset among quota-gated steps that were skipped.
    pub fn quota_reset(&self) -> Option<DateTime<Utc>> {
        self.skip_reasons()
            .into_iter()
            .filter_map(|(_, reason)| match reason {
                SkipReason::QuotaExhausted { reset_at } => Some(*reset_at),
                _ => None,
            })
            .min()
    }

    /// Whether a later deferred attempt could succeed, and why.
    ///
    /// `None` when every step declined or failed permanently.
    pub fn retry_reason(&self) -> Option<RetryReason> {
        if self.has_success() {
            return None;
        }
        if self.quota_reset().is_some() {
            return Some(RetryReason::QuotaExhausted);
        }

        let mut reason = None;
        for attempt in &self.attempts {
            match &attempt.outcome {
                StepOutcome::TimedOut { .. } | StepOutcome::Skipped(SkipReason::BudgetExhausted) => {
                    return Some(RetryReason::Timeout);
                }
                StepOutcome::Error { retryable: true, .. }
                | StepOutcome::Skipped(SkipReason::CircuitOpen | SkipReason::RateLimited) => {
                    reason = Some(RetryReason::TransientFailure);
                }
                _ => {}
            }
        }
        reason
    }
}

/// How a chain run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChainStatus {
    /// A step produced a result.
    Found,
    /// Every step declined, failed, timed out or was skipped.
    Exhausted,
    /// The budget was gone before any step could be attempted.
    TotalTimeout,
}

/// Result of one chain run.
#[derive(Clone, Debug)]
pub struct ChainOutcome {
    pub value: Option<Coordinates>,
    /// Name of the step that produced `value`.
    pub source: Option<String>,
    pub status: ChainStatus,
    pub elapsed: Duration,
    pub diagnostics: ChainDiagnostics,
}

/// Counters across all runs of a chain.
#[derive(Debug, Default)]
struct ChainCounters {
    runs: AtomicU64,
    found: AtomicU64,
    exhausted: AtomicU64,
    total_timeouts: AtomicU64,
    step_timeouts: AtomicU64,
    step_errors: AtomicU64,
    steps_skipped: AtomicU64,
}

/// Snapshot of chain counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainMetrics {
    pub runs: u64,
    pub found: u64,
    pub exhausted: u64,
    pub total_timeouts: u64,
    pub step_timeouts: u64,
    pub step_errors: u64,
    pub steps_skipped: u64,
}

/// Ordered fallback steps sharing one time budget.
pub struct TimeoutBudgetChain {
    steps: Vec<Arc<dyn FallbackStep>>,
    total_timeout: Duration,
    pool: Arc<Semaphore>,
    counters: ChainCounters,
}

impl TimeoutBudgetChain {
    pub fn new(
        steps: Vec<Arc<dyn FallbackStep>>,
        total_timeout: Duration,
        worker_pool_size: usize,
    ) -> Self {
        Self {
            steps,
            total_timeout,
            pool: Arc::new(Semaphore::new(worker_pool_size.max(1))),
            counters: ChainCounters::default(),
        }
    }

    pub fn total_timeout(&self) -> Duration {
        self.total_timeout
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run the chain for `request`. Never fails; "no result" is `value: None`.
    pub async fn run(&self, request: GeocodeRequest) -> ChainOutcome {
        self.counters.runs.fetch_add(1, Ordering::Relaxed);

        let request = Arc::new(request);
        let started = Instant::now();
        let deadline = started + self.total_timeout;
        let mut diagnostics = ChainDiagnostics::new();
        let mut attempted = 0usize;

        for (index, step) in self.steps.iter().enumerate() {
            let now = Instant::now();
            if now >= deadline {
                for skipped in &self.steps[index..] {
                    diagnostics.record_skip(skipped.name(), SkipReason::BudgetExhausted);
                    self.counters.steps_skipped.fetch_add(1, Ordering::Relaxed);
                }
                break;
            }

            let effective = step.timeout().min(deadline - now);
            attempted += 1;

            let step_started = Instant::now();
            let (outcome, value) = self.run_step(step, &request, effective).await;
            diagnostics.record(step.name(), outcome.clone(), step_started.elapsed());

            match outcome {
                StepOutcome::Success => {
                    self.counters.found.fetch_add(1, Ordering::Relaxed);
                    debug!("Geocode chain: {}", diagnostics.summary());
                    return ChainOutcome {
                        value,
                        source: Some(step.name().to_string()),
                        status: ChainStatus::Found,
                        elapsed: started.elapsed(),
                        diagnostics,
                    };
                }
                StepOutcome::TimedOut { .. } => {
                    self.counters.step_timeouts.fetch_add(1, Ordering::Relaxed);
                }
                StepOutcome::Error { .. } => {
                    self.counters.step_errors.fetch_add(1, Ordering::Relaxed);
                }
                StepOutcome::Skipped(_) => {
                    self.counters.steps_skipped.fetch_add(1, Ordering::Relaxed);
                }
                StepOutcome::Declined => {}
            }
        }

        let elapsed = started.elapsed();
        let status = if attempted == 0 && elapsed >= self.total_timeout {
            self.counters.total_timeouts.fetch_add(1, Ordering::Relaxed);
            ChainStatus::TotalTimeout
        } else {
            self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
            ChainStatus::Exhausted
        };

        debug!(
            "Geocode chain: no result for '{}' after {:?}: {}",
            request.normalized_key(),
            elapsed,
            diagnostics.summary()
        );

        ChainOutcome {
            value: None,
            source: None,
            status,
            elapsed,
            diagnostics,
        }
    }

    /// Run one step on the worker pool, waiting at most `effective`.
    async fn run_step(
        &self,
        step: &Arc<dyn FallbackStep>,
        request: &Arc<GeocodeRequest>,
        effective: Duration,
    ) -> (StepOutcome, Option<Coordinates>) {
        let deadline = Instant::now() + effective;
        let timed_out = StepOutcome::TimedOut {
            timeout_ms: effective.as_millis() as u64,
        };

        // Waiting for a free worker counts against the step's time.
        let permit = match timeout_at(deadline, self.pool.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                let outcome = StepOutcome::Error {
                    message: "worker pool closed".to_string(),
                    retryable: false,
                };
                return (outcome, None);
            }
            Err(_) => return (timed_out, None),
        };

        let cancel = CancellationToken::new();
        let task = {
            let step = step.clone();
            let request = request.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let _permit = permit;
                step.run(request, cancel).await
            })
        };

        match timeout_at(deadline, task).await {
            Ok(Ok(Ok(Some(value)))) => (StepOutcome::Success, Some(value)),
            Ok(Ok(Ok(None))) => (StepOutcome::Declined, None),
            Ok(Ok(Err(e))) => (StepOutcome::from_error(e, effective), None),
            Ok(Err(join_error)) => {
                warn!("Geocode chain: step '{}' panicked: {}", step.name(), join_error);
                let outcome = StepOutcome::Error {
                    message: format!("step panicked: {}", join_error),
                    retryable: true,
                };
                (outcome, None)
            }
            Err(_) => {
                debug!(
                    "Geocode chain: step '{}' exceeded {:?}, abandoning",
                    step.name(),
                    effective
                );
                cancel.cancel();
                (timed_out, None)
            }
        }
    }

    pub fn metrics(&self) -> ChainMetrics {
        ChainMetrics {
            runs: self.counters.runs.load(Ordering::Relaxed),
            found: self.counters.found.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            total_timeouts: self.counters.total_timeouts.load(Ordering::Relaxed),
            step_timeouts: self.counters.step_timeouts.load(Ordering::Relaxed),
            step_errors: self.counters.step_errors.load(Ordering::Relaxed),
            steps_skipped: self.counters.steps_skipped.load(Ordering::Relaxed),
        }
    }
}
