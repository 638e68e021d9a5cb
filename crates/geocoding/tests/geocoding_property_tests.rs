//! Property-based integration tests for the geocoding chain and scheduler.
//!
//! The time budget, per-key deduplication and quota-reset scheduling must
//! hold for arbitrary step timings and request interleavings.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use enrichment_geocoding::{
    Coordinates, DeferredRetryScheduler, FallbackStep, GeocodeRequest, InMemoryInFlight,
    InMemoryJobQueue, Priority, QuotaSource, QuotaStatus, RetryReason, ScheduleOutcome,
    SchedulerConfig, TimeoutBudgetChain, WorkItem,
};
use enrichment_resilience::ResilienceError;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Fixtures
// =============================================================================

/// Step that takes `delay` and then answers, ignoring cancellation.
struct TimedStep {
    name: String,
    timeout: Duration,
    delay: Duration,
    finds: bool,
}

#[async_trait]
impl FallbackStep for TimedStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(
        &self,
        _request: Arc<GeocodeRequest>,
        _cancel: CancellationToken,
    ) -> Result<Option<Coordinates>, ResilienceError> {
        tokio::time::sleep(self.delay).await;
        Ok(self.finds.then(|| Coordinates::new(10.0, 20.0)))
    }
}

struct FixedQuota(QuotaStatus);

impl QuotaSource for FixedQuota {
    fn quota_status(&self) -> QuotaStatus {
        self.0.clone()
    }
}

fn scheduler(remaining: u64, reset_at: DateTime<Utc>) -> (Arc<DeferredRetryScheduler>, Arc<InMemoryJobQueue>) {
    let queue = Arc::new(InMemoryJobQueue::new());
    let scheduler = DeferredRetryScheduler::new(
        queue.clone(),
        Arc::new(FixedQuota(QuotaStatus {
            remaining,
            limit: 2_500,
            reset_at,
        })),
        Arc::new(InMemoryInFlight::new()),
        SchedulerConfig::default(),
    );
    (Arc::new(scheduler), queue)
}

fn arb_reason() -> impl Strategy<Value = RetryReason> {
    prop_oneof![
        Just(RetryReason::QuotaExhausted),
        Just(RetryReason::Timeout),
        Just(RetryReason::TransientFailure),
    ]
}

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

// =============================================================================
// Timeout budget chain
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A run never takes longer than the total budget, whatever the steps do.
    #[test]
    fn prop_chain_respects_total_budget(
        total_ms in 0u64..8_000,
        steps in proptest::collection::vec((1u64..6_000, 0u64..10_000, any::<bool>()), 1..5),
    ) {
        let runtime = paused_runtime();
        let total = Duration::from_millis(total_ms);

        let (elapsed, found) = runtime.block_on(async {
            let steps: Vec<Arc<dyn FallbackStep>> = steps
                .iter()
                .enumerate()
                .map(|(i, (timeout_ms, delay_ms, finds))| {
                    Arc::new(TimedStep {
                        name: format!("step-{i}"),
                        timeout: Duration::from_millis(*timeout_ms),
                        delay: Duration::from_millis(*delay_ms),
                        finds: *finds,
                    }) as Arc<dyn FallbackStep>
                })
                .collect();
            let chain = TimeoutBudgetChain::new(steps, total, 2);

            let started = tokio::time::Instant::now();
            let outcome = chain.run(GeocodeRequest::new("Quito", Some("EC"))).await;
            (started.elapsed(), outcome.value.is_some())
        });

        prop_assert!(elapsed <= total + Duration::from_millis(1));
        if total.is_zero() {
            prop_assert!(!found);
        }
    }
}

// =============================================================================
// Deferred retry scheduler
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Concurrent requests for one place enqueue exactly one job.
    #[test]
    fn prop_concurrent_requests_enqueue_once(
        spellings in proptest::collection::vec(
            prop_oneof![Just("Lima"), Just("lima"), Just(" LIMA "), Just("Lima  ")],
            2..12,
        ),
        reason in arb_reason(),
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .build()
            .unwrap();

        let (outcomes, queued) = runtime.block_on(async {
            let (scheduler, queue) = scheduler(100, Utc::now());
            let handles: Vec<_> = spellings
                .into_iter()
                .map(|location| {
                    let scheduler = scheduler.clone();
                    tokio::spawn(async move {
                        let item = WorkItem::new(GeocodeRequest::new(location, Some("PE")), Priority::Normal);
                        scheduler.schedule_retry(&item, reason, 0).await.unwrap()
                    })
                })
                .collect();

            let outcomes: Vec<ScheduleOutcome> = futures::future::join_all(handles)
                .await
                .into_iter()
                .map(|r| r.unwrap())
                .collect();
            (outcomes, queue.len())
        });

        let scheduled = outcomes
            .iter()
            .filter(|o| matches!(o, ScheduleOutcome::Scheduled { .. }))
            .count();
        prop_assert_eq!(scheduled, 1);
        prop_assert_eq!(queued, 1);
    }

    /// With the quota exhausted, nothing is scheduled before the reset.
    #[test]
    fn prop_exhausted_quota_waits_for_reset(
        reset_in_minutes in 0i64..(48 * 60),
        attempt in 0u32..7,
        reason in arb_reason(),
    ) {
        let runtime = paused_runtime();
        let reset_at = Utc::now() + chrono::Duration::minutes(reset_in_minutes);

        let outcome = runtime.block_on(async {
            let (scheduler, _queue) = scheduler(0, reset_at);
            let item = WorkItem::new(GeocodeRequest::new("Bogota", Some("CO")), Priority::Low);
            scheduler.schedule_retry(&item, reason, attempt).await.unwrap()
        });

        match outcome {
            ScheduleOutcome::Scheduled { scheduled_at, .. } => prop_assert!(scheduled_at >= reset_at),
            other => prop_assert!(false, "unexpected outcome {:?}", other),
        }
    }

    /// Table delays never shrink as attempts grow, and stay capped.
    #[test]
    fn prop_backoff_table_monotonic_and_capped(attempt in 0u32..50) {
        let queue = Arc::new(InMemoryJobQueue::new());
        let config = SchedulerConfig { jitter: 0.0, ..SchedulerConfig::default() };
        let cap = *config.backoff_steps.last().unwrap();
        let scheduler = DeferredRetryScheduler::new(
            queue,
            Arc::new(FixedQuota(QuotaStatus { remaining: 1, limit: 1, reset_at: Utc::now() })),
            Arc::new(InMemoryInFlight::new()),
            config,
        );

        let current = scheduler.backoff_delay(attempt);
        let next = scheduler.backoff_delay(attempt + 1);
        prop_assert!(current <= next);
        prop_assert!(next <= cap);
    }
}
