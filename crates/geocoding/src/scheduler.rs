//! Deferred retries for lookups that cannot complete now.
//!
//! Work is handed to a durable queue instead of being retried in-process.
//! When the gating quota is exhausted the job is scheduled just after the
//! quota resets; otherwise the delay comes from a fixed backoff table with
//! ±10% jitter. At most one job per normalized key is in flight.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::GeocodingError;
use crate::models::{Job, WorkItem};
use crate::traits::{InFlightStore, JobQueue, QuotaSource};

/// Operation name carried by geocoding jobs.
pub const GEOCODE_OPERATION: &str = "geocode";

/// Delay before each deferred attempt; the last entry repeats.
pub const DEFAULT_BACKOFF_STEPS: [Duration; 5] = [
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
    Duration::from_secs(60 * 60),
    Duration::from_secs(6 * 60 * 60),
];

/// Multiplicative jitter applied to table delays.
const DEFAULT_JITTER: f64 = 0.1;

/// Margin after a quota reset before the deferred job runs.
const DEFAULT_QUOTA_RESET_OFFSET: Duration = Duration::from_secs(5 * 60);

/// Deferred attempts before a lookup is dropped.
const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Why a lookup was deferred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RetryReason {
    /// First background attempt, not a retry.
    Initial,
    QuotaExhausted,
    Timeout,
    TransientFailure,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::QuotaExhausted => write!(f, "quota exhausted"),
            Self::Timeout => write!(f, "timeout"),
            Self::TransientFailure => write!(f, "transient failure"),
        }
    }
}

/// Scheduler configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct SchedulerConfig {
    /// Indexed by `min(attempt, len - 1)`. Must be non-decreasing.
    pub backoff_steps: Vec<Duration>,
    /// Fractional jitter, e.g. `0.1` for ±10%.
    pub jitter: f64,
    pub quota_reset_offset: Duration,
    pub max_attempts: u32,
    pub operation: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backoff_steps: DEFAULT_BACKOFF_STEPS.to_vec(),
            jitter: DEFAULT_JITTER,
            quota_reset_offset: DEFAULT_QUOTA_RESET_OFFSET,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            operation: GEOCODE_OPERATION.to_string(),
        }
    }
}

/// Result of a scheduling request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled {
        job_id: Uuid,
        scheduled_at: DateTime<Utc>,
    },
    /// A job for the same key is already in flight.
    Duplicate,
    /// Attempts exhausted; the lookup is dropped.
    GaveUp,
}

/// Releases a key's in-flight marker when dropped.
pub struct InFlightGuard {
    store: Arc<dyn InFlightStore>,
    key: String,
}

impl InFlightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.store.release(&self.key);
    }
}

/// Schedules background lookups on a durable queue.
pub struct DeferredRetryScheduler {
    queue: Arc<dyn JobQueue>,
    quota: Arc<dyn QuotaSource>,
    in_flight: Arc<dyn InFlightStore>,
    config: SchedulerConfig,
}

impl DeferredRetryScheduler {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        quota: Arc<dyn QuotaSource>,
        in_flight: Arc<dyn InFlightStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            queue,
            quota,
            in_flight,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains(key)
    }

    /// Table delay for `attempt`, with jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let steps = &self.config.backoff_steps;
        let Some(last) = steps.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        let base = steps[(attempt as usize).min(last)];

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        base.mul_f64(factor)
    }

    /// When a job deferred after `attempt` should run.
    ///
    /// An exhausted quota always wins over backoff: the job lands after the
    /// reset, never earlier.
    pub fn next_run_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let quota = self.quota.quota_status();
        if quota.is_exhausted() {
            return add_std(quota.reset_at, self.config.quota_reset_offset);
        }
        add_std(now, self.backoff_delay(attempt))
    }

    /// Queue the first background attempt for `item`.
    ///
    /// Runs immediately unless the quota is exhausted.
    pub async fn enqueue(&self, item: &WorkItem) -> Result<ScheduleOutcome, GeocodingError> {
        let now = Utc::now();
        let quota = self.quota.quota_status();
        let scheduled_at = if quota.is_exhausted() {
            add_std(quota.reset_at, self.config.quota_reset_offset)
        } else {
            now
        };
        self.schedule(item, RetryReason::Initial, 0, scheduled_at).await
    }

    /// Defer `item` after failed attempt number `attempt` (0-based).
    pub async fn schedule_retry(
        &self,
        item: &WorkItem,
        reason: RetryReason,
        attempt: u32,
    ) -> Result<ScheduleOutcome, GeocodingError> {
        let next_attempt = attempt.saturating_add(1);
        if next_attempt > self.config.max_attempts {
            warn!(
                "Scheduler: giving up on '{}' after {} attempts ({})",
                item.normalized_key, next_attempt, reason
            );
            return Ok(ScheduleOutcome::GaveUp);
        }

        let scheduled_at = self.next_run_at(attempt, Utc::now());
        self.schedule(item, reason, next_attempt, scheduled_at).await
    }

    async fn schedule(
        &self,
        item: &WorkItem,
        reason: RetryReason,
        attempt: u32,
        scheduled_at: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, GeocodingError> {
        let mut item = item.clone();
        item.attempt = attempt;
        item.scheduled_at = scheduled_at;

        let job = Job {
            id: Uuid::new_v4(),
            target_operation: self.config.operation.clone(),
            args: serde_json::to_value(&item)?,
            scheduled_at,
            attempt,
            priority: item.priority,
        };

        if !self.in_flight.try_mark(&item.normalized_key) {
            debug!(
                "Scheduler: '{}' already in flight, not enqueuing",
                item.normalized_key
            );
            return Ok(ScheduleOutcome::Duplicate);
        }

        if let Err(e) = self.queue.enqueue_at(job.clone()).await {
            self.in_flight.release(&item.normalized_key);
            return Err(e);
        }

        info!(
            "Scheduler: '{}' attempt {} at {} ({})",
            item.normalized_key, attempt, scheduled_at, reason
        );
        Ok(ScheduleOutcome::Scheduled {
            job_id: job.id,
            scheduled_at,
        })
    }

    /// Claim a job for processing.
    ///
    /// The returned guard owns the key's in-flight marker and releases it
    /// when dropped, whichever way processing ends. Drop it before
    /// re-scheduling the item.
    ///
    /// A job that cannot be processed still releases the marker of the key
    /// its args name, so the key is not blocked for good.
    pub fn start_job(&self, job: &Job) -> Result<(WorkItem, InFlightGuard), GeocodingError> {
        let claimed = job
            .args
            .get("normalizedKey")
            .and_then(serde_json::Value::as_str)
            .map(|key| self.guard(key));

        if job.target_operation != self.config.operation {
            warn!(
                "Scheduler: rejecting job {} with operation '{}'",
                job.id, job.target_operation
            );
            return Err(GeocodingError::InvalidJob(format!(
                "unexpected operation '{}'",
                job.target_operation
            )));
        }

        let mut item: WorkItem = serde_json::from_value(job.args.clone())?;
        item.attempt = job.attempt;

        let guard = claimed.unwrap_or_else(|| self.guard(&item.normalized_key));
        Ok((item, guard))
    }

    fn guard(&self, key: &str) -> InFlightGuard {
        InFlightGuard {
            store: self.in_flight.clone(),
            key: key.to_string(),
        }
    }
}

fn add_std(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
