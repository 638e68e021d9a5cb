//! Geocoding entry points.
//!
//! [`GeocodingService`] wires the cache, a quota-gated primary geocoder and
//! an optional fallback geocoder into a [`TimeoutBudgetChain`], and hands
//! lookups that cannot complete now to the [`DeferredRetryScheduler`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use enrichment_resilience::{ErrorKind, ResilienceError, ResilienceRegistry};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::chain::{
    ChainMetrics, FallbackStep, TimeoutBudgetChain, DEFAULT_TOTAL_TIMEOUT, DEFAULT_WORKER_POOL_SIZE,
};
use crate::errors::GeocodingError;
use crate::models::{Coordinates, GeocodeRequest, Job, Priority, QuotaStatus, WorkItem};
use crate::quota::DailyQuota;
use crate::scheduler::{DeferredRetryScheduler, RetryReason, ScheduleOutcome, SchedulerConfig};
use crate::traits::{GeocodeCache, Geocoder, InFlightStore, JobQueue, QuotaCounter, QuotaSource};

/// Name of the cache step in diagnostics.
pub const CACHE_STEP: &str = "cache";

/// Geocoding settings.
#[derive(Clone, Debug, PartialEq)]
pub struct GeocodingConfig {
    /// Budget shared by all steps of one lookup.
    pub total_timeout: Duration,
    pub cache_timeout: Duration,
    pub primary_timeout: Duration,
    pub fallback_timeout: Duration,
    pub worker_pool_size: usize,
    /// How long resolved places stay cached.
    pub cache_ttl: Duration,
    /// Daily call allowance of the primary geocoder.
    pub daily_quota_limit: u64,
    pub scheduler: SchedulerConfig,
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self {
            total_timeout: DEFAULT_TOTAL_TIMEOUT,
            cache_timeout: Duration::from_secs(1),
            primary_timeout: Duration::from_secs(3),
            fallback_timeout: Duration::from_secs(3),
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            cache_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            daily_quota_limit: 2_500,
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Storage collaborators for [`GeocodingService`].
#[derive(Clone)]
pub struct GeocodingStores {
    pub cache: Arc<dyn GeocodeCache>,
    pub queue: Arc<dyn JobQueue>,
    pub in_flight: Arc<dyn InFlightStore>,
}

/// Cache lookup step.
pub struct CacheStep {
    cache: Arc<dyn GeocodeCache>,
    timeout: Duration,
}

impl CacheStep {
    pub fn new(cache: Arc<dyn GeocodeCache>, timeout: Duration) -> Self {
        Self { cache, timeout }
    }
}

#[async_trait]
impl FallbackStep for CacheStep {
    fn name(&self) -> &str {
        CACHE_STEP
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(
        &self,
        request: Arc<GeocodeRequest>,
        _cancel: CancellationToken,
    ) -> Result<Option<Coordinates>, ResilienceError> {
        Ok(self.cache.get(&request.normalized_key()).await)
    }
}

/// A geocoder call protected by the resilience registry and, optionally, a
/// daily quota.
pub struct GeocoderStep {
    geocoder: Arc<dyn Geocoder>,
    registry: Arc<ResilienceRegistry>,
    quota: Option<Arc<dyn QuotaCounter>>,
    timeout: Duration,
}

impl GeocoderStep {
    pub fn new(
        geocoder: Arc<dyn Geocoder>,
        registry: Arc<ResilienceRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            geocoder,
            registry,
            quota: None,
            timeout,
        }
    }

    /// Charge every provider call to `quota`.
    pub fn with_quota(mut self, quota: Arc<dyn QuotaCounter>) -> Self {
        self.quota = Some(quota);
        self
    }
}

#[async_trait]
impl FallbackStep for GeocoderStep {
    fn name(&self) -> &str {
        self.geocoder.id()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(
        &self,
        request: Arc<GeocodeRequest>,
        cancel: CancellationToken,
    ) -> Result<Option<Coordinates>, ResilienceError> {
        let provider = self.geocoder.id();
        let quota = self.quota.as_deref();

        if let Some(quota) = quota {
            let status = quota.quota_status();
            if status.is_exhausted() {
                return Err(quota_exhausted(provider, status));
            }
        }

        // Charged once per real provider call, after the circuit and rate
        // limiter let it through.
        let admit = move || match quota {
            Some(quota) if !quota.try_consume() => {
                Err(quota_exhausted(provider, quota.quota_status()))
            }
            _ => Ok(()),
        };

        let geocoder: &dyn Geocoder = self.geocoder.as_ref();
        let location = request.location.as_str();
        let country = request.country.as_deref();
        let token = &cancel;
        let call = self.registry.call_gated(provider, admit, move || {
            geocoder.geocode(location, country, token.clone())
        });

        let result = tokio::select! {
            result = call => result,
            _ = cancel.cancelled() => Err(ResilienceError::StepTimeout {
                step: provider.to_string(),
                timeout: self.timeout,
            }),
        };

        if let (Err(e), Some(quota)) = (&result, quota) {
            if provider_reported_quota(e) {
                quota.mark_exhausted();
            }
        }
        result
    }
}

fn quota_exhausted(provider: &str, status: QuotaStatus) -> ResilienceError {
    ResilienceError::QuotaExhausted {
        provider: provider.to_string(),
        reset_at: status.reset_at,
    }
}

/// Whether the provider itself answered with throttling, as opposed to our
/// own rate limiter denying the call.
fn provider_reported_quota(error: &ResilienceError) -> bool {
    matches!(
        error,
        ResilienceError::Transient {
            kind: ErrorKind::RateLimited,
            ..
        } | ResilienceError::Permanent {
            kind: ErrorKind::RateLimited,
            ..
        }
    )
}

/// Cache-first geocoding with a bounded time budget and deferred retries.
pub struct GeocodingService {
    chain: TimeoutBudgetChain,
    cache: Arc<dyn GeocodeCache>,
    scheduler: DeferredRetryScheduler,
    quota: Arc<dyn QuotaCounter>,
    registry: Arc<ResilienceRegistry>,
    config: GeocodingConfig,
}

impl GeocodingService {
    /// Build the service with an in-process [`DailyQuota`] of
    /// `config.daily_quota_limit` for `primary`. The count starts from zero
    /// on every start; use [`with_quota`](Self::with_quota) to supply a
    /// persistent one.
    pub fn new(
        primary: Arc<dyn Geocoder>,
        fallback: Option<Arc<dyn Geocoder>>,
        stores: GeocodingStores,
        registry: Arc<ResilienceRegistry>,
        config: GeocodingConfig,
    ) -> Self {
        let quota = Arc::new(DailyQuota::new(primary.id(), config.daily_quota_limit));
        Self::with_quota(primary, fallback, stores, registry, quota, config)
    }

    /// Build the service charging `primary` against `quota`. Only `primary`
    /// is quota-gated; the scheduler reads the same quota to place deferred
    /// jobs after its reset.
    pub fn with_quota<Q>(
        primary: Arc<dyn Geocoder>,
        fallback: Option<Arc<dyn Geocoder>>,
        stores: GeocodingStores,
        registry: Arc<ResilienceRegistry>,
        quota: Arc<Q>,
        config: GeocodingConfig,
    ) -> Self
    where
        Q: QuotaCounter + 'static,
    {
        let source: Arc<dyn QuotaSource> = quota.clone();
        let quota: Arc<dyn QuotaCounter> = quota;

        let mut steps: Vec<Arc<dyn FallbackStep>> = vec![
            Arc::new(CacheStep::new(stores.cache.clone(), config.cache_timeout)),
            Arc::new(
                GeocoderStep::new(primary, registry.clone(), config.primary_timeout)
                    .with_quota(quota.clone()),
            ),
        ];
        if let Some(fallback) = fallback {
            steps.push(Arc::new(GeocoderStep::new(
                fallback,
                registry.clone(),
                config.fallback_timeout,
            )));
        }

        let chain = TimeoutBudgetChain::new(steps, config.total_timeout, config.worker_pool_size);
        let scheduler = DeferredRetryScheduler::new(
            stores.queue,
            source,
            stores.in_flight,
            config.scheduler.clone(),
        );

        info!(
            "Geocoding: steps [{}], budget {:?}",
            chain.step_names().join(", "),
            config.total_timeout
        );

        Self {
            chain,
            cache: stores.cache,
            scheduler,
            quota,
            registry,
            config,
        }
    }

    /// Resolve a place within the time budget.
    ///
    /// Never fails: any problem yields `None`. When the primary's quota is
    /// exhausted the lookup is also queued to run after the reset.
    pub async fn geocode(&self, location: &str, country: Option<&str>) -> Option<Coordinates> {
        let request = GeocodeRequest::new(location, country);
        let key = request.normalized_key();
        if key.is_empty() {
            return None;
        }

        let outcome = self.chain.run(request.clone()).await;
        if let Some(value) = outcome.value {
            if outcome.source.as_deref() != Some(CACHE_STEP) {
                self.cache.set(&key, value, self.config.cache_ttl).await;
            }
            return Some(value);
        }

        if outcome.diagnostics.retry_reason() == Some(RetryReason::QuotaExhausted) {
            let item = WorkItem::new(request, Priority::Normal);
            match self.scheduler.enqueue(&item).await {
                Ok(scheduled) => debug!("Geocoding: deferred '{}': {:?}", key, scheduled),
                Err(e) => warn!("Geocoding: failed to defer '{}': {}", key, e),
            }
        }
        None
    }

    /// Queue a background lookup.
    pub async fn enqueue_geocode(
        &self,
        location: &str,
        country: Option<&str>,
        priority: Priority,
    ) -> Result<ScheduleOutcome, GeocodingError> {
        let request = GeocodeRequest::new(location, country);
        if request.normalized_key().is_empty() {
            return Err(GeocodingError::InvalidJob("empty location".to_string()));
        }
        self.scheduler
            .enqueue(&WorkItem::new(request, priority))
            .await
    }

    pub fn get_quota_status(&self) -> QuotaStatus {
        self.quota.quota_status()
    }

    /// Run a job taken from the durable queue.
    ///
    /// The key's in-flight marker is released before this returns, on every
    /// path. Lookups that may succeed later are re-scheduled.
    pub async fn process_job(&self, job: &Job) -> Result<Option<Coordinates>, GeocodingError> {
        let (item, guard) = self.scheduler.start_job(job)?;
        let key = item.normalized_key.clone();

        let outcome = self.chain.run(item.request.clone()).await;
        if let Some(value) = outcome.value {
            if outcome.source.as_deref() != Some(CACHE_STEP) {
                self.cache.set(&key, value, self.config.cache_ttl).await;
            }
            info!("Geocoding: job for '{}' resolved on attempt {}", key, job.attempt);
            return Ok(Some(value));
        }

        let reason = outcome.diagnostics.retry_reason();
        drop(guard);

        match reason {
            Some(reason) => {
                self.scheduler
                    .schedule_retry(&item, reason, job.attempt)
                    .await?;
            }
            None => info!(
                "Geocoding: no result for '{}', not retrying: {}",
                key,
                outcome.diagnostics.summary()
            ),
        }
        Ok(None)
    }

    pub fn chain_metrics(&self) -> ChainMetrics {
        self.chain.metrics()
    }

    pub fn scheduler(&self) -> &DeferredRetryScheduler {
        &self.scheduler
    }

    pub fn registry(&self) -> &ResilienceRegistry {
        &self.registry
    }

    pub fn config(&self) -> &GeocodingConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryCache, InMemoryInFlight, InMemoryJobQueue};
    use chrono::{DateTime, Utc};
    use enrichment_resilience::{
        CircuitBreaker, CircuitState, ErrorPolicy, ProviderError, RateLimiter, RetryConfig,
        RetryExecutor,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    enum Reply {
        Found(Coordinates),
        NotFound,
        Status(u16),
        Hang,
    }

    struct MockGeocoder {
        id: &'static str,
        reply: Reply,
        calls: AtomicUsize,
    }

    impl MockGeocoder {
        fn new(id: &'static str, reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                id,
                reply,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Geocoder for MockGeocoder {
        fn id(&self) -> &'static str {
            self.id
        }

        async fn geocode(
            &self,
            _location: &str,
            _country: Option<&str>,
            cancel: CancellationToken,
        ) -> Result<Option<Coordinates>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Reply::Found(c) => Ok(Some(*c)),
                Reply::NotFound => Ok(None),
                Reply::Status(status) => Err(ProviderError::http(*status, "provider error")),
                Reply::Hang => {
                    cancel.cancelled().await;
                    Err(ProviderError::Timeout("cancelled".to_string()))
                }
            }
        }
    }

    /// Quota held elsewhere that is already spent for the day.
    struct SpentQuota {
        reset_at: DateTime<Utc>,
        consumed: AtomicUsize,
    }

    impl QuotaSource for SpentQuota {
        fn quota_status(&self) -> QuotaStatus {
            QuotaStatus {
                remaining: 0,
                limit: 2_500,
                reset_at: self.reset_at,
            }
        }
    }

    impl QuotaCounter for SpentQuota {
        fn try_consume(&self) -> bool {
            self.consumed.fetch_add(1, Ordering::SeqCst);
            false
        }

        fn mark_exhausted(&self) {}
    }

    fn registry(max_retries: u32) -> Arc<ResilienceRegistry> {
        let retry = RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter: false,
        };
        Arc::new(ResilienceRegistry::with_components(
            RateLimiter::new(),
            CircuitBreaker::new(),
            RetryExecutor::new(retry, ErrorPolicy::default()),
            Duration::from_millis(100),
        ))
    }

    fn stores(
        cache: &Arc<InMemoryCache>,
        queue: &Arc<InMemoryJobQueue>,
        in_flight: &Arc<InMemoryInFlight>,
    ) -> GeocodingStores {
        GeocodingStores {
            cache: cache.clone(),
            queue: queue.clone(),
            in_flight: in_flight.clone(),
        }
    }

    struct Harness {
        service: GeocodingService,
        cache: Arc<InMemoryCache>,
        queue: Arc<InMemoryJobQueue>,
        in_flight: Arc<InMemoryInFlight>,
    }

    fn harness(
        primary: Arc<MockGeocoder>,
        fallback: Option<Arc<MockGeocoder>>,
        daily_quota_limit: u64,
    ) -> Harness {
        let cache = Arc::new(InMemoryCache::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let in_flight = Arc::new(InMemoryInFlight::new());

        let config = GeocodingConfig {
            daily_quota_limit,
            ..GeocodingConfig::default()
        };
        let fallback = fallback.map(|f| f as Arc<dyn Geocoder>);
        let service = GeocodingService::new(
            primary,
            fallback,
            stores(&cache, &queue, &in_flight),
            registry(0),
            config,
        );

        Harness {
            service,
            cache,
            queue,
            in_flight,
        }
    }

    fn paris() -> Coordinates {
        Coordinates::new(48.85, 2.35)
    }

    #[tokio::test]
    async fn test_found_result_is_cached() {
        let primary = MockGeocoder::new("PRIMARY", Reply::Found(paris()));
        let h = harness(primary.clone(), None, 10);

        assert_eq!(h.service.geocode("Paris", Some("FR")).await, Some(paris()));
        assert_eq!(h.cache.get("paris,fr").await, Some(paris()));

        assert_eq!(h.service.geocode(" paris ", Some("fr")).await, Some(paris()));
        assert_eq!(primary.calls(), 1);
        assert_eq!(h.service.get_quota_status().remaining, 9);
    }

    #[tokio::test]
    async fn test_falls_back_after_primary_error() {
        let primary = MockGeocoder::new("PRIMARY", Reply::Status(503));
        let fallback = MockGeocoder::new("FALLBACK", Reply::Found(paris()));
        let h = harness(primary.clone(), Some(fallback.clone()), 10);

        assert_eq!(h.service.geocode("Paris", Some("FR")).await, Some(paris()));
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 1);
        assert_eq!(h.service.chain_metrics().step_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_primary_stays_within_budget() {
        let primary = MockGeocoder::new("PRIMARY", Reply::Hang);
        let fallback = MockGeocoder::new("FALLBACK", Reply::Found(paris()));
        let h = harness(primary, Some(fallback), 10);

        let started = tokio::time::Instant::now();
        assert_eq!(h.service.geocode("Paris", Some("FR")).await, Some(paris()));
        assert!(started.elapsed() <= h.service.config().total_timeout);
        assert_eq!(h.service.chain_metrics().step_timeouts, 1);
    }

    #[tokio::test]
    async fn test_exhausted_quota_defers_until_reset() {
        let primary = MockGeocoder::new("PRIMARY", Reply::Found(paris()));
        let h = harness(primary.clone(), None, 0);

        assert_eq!(h.service.geocode("Paris", Some("FR")).await, None);
        assert_eq!(primary.calls(), 0);

        let jobs = h.queue.jobs();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].scheduled_at >= h.service.get_quota_status().reset_at);
        assert!(h.in_flight.contains("paris,fr"));

        // A second request for the same place is not queued again.
        assert_eq!(h.service.geocode("paris", Some("fr")).await, None);
        assert_eq!(h.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_provider_throttling_marks_quota_exhausted() {
        let primary = MockGeocoder::new("PRIMARY", Reply::Status(429));
        let h = harness(primary, None, 100);

        assert_eq!(h.service.geocode("Paris", Some("FR")).await, None);
        assert_eq!(h.service.get_quota_status().remaining, 0);
    }

    #[tokio::test]
    async fn test_process_job_resolves_and_releases() {
        let primary = MockGeocoder::new("PRIMARY", Reply::Found(paris()));
        let h = harness(primary, None, 10);

        let outcome = h
            .service
            .enqueue_geocode("Paris", Some("FR"), Priority::High)
            .await
            .unwrap();
        assert!(matches!(outcome, ScheduleOutcome::Scheduled { .. }));

        let job = h.queue.take_due(Utc::now()).pop().unwrap();
        let result = h.service.process_job(&job).await.unwrap();

        assert_eq!(result, Some(paris()));
        assert_eq!(h.cache.get("paris,fr").await, Some(paris()));
        assert!(h.in_flight.is_empty());
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn test_process_job_reschedules_transient_failure() {
        let primary = MockGeocoder::new("PRIMARY", Reply::Status(503));
        let h = harness(primary, None, 10);

        h.service
            .enqueue_geocode("Paris", Some("FR"), Priority::Normal)
            .await
            .unwrap();
        let job = h.queue.take_due(Utc::now()).pop().unwrap();

        assert_eq!(h.service.process_job(&job).await.unwrap(), None);

        let jobs = h.queue.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].attempt, 1);
        assert!(jobs[0].scheduled_at > Utc::now());
        assert!(h.in_flight.contains("paris,fr"));
    }

    #[tokio::test]
    async fn test_process_job_drops_unknown_place() {
        let primary = MockGeocoder::new("PRIMARY", Reply::NotFound);
        let h = harness(primary, None, 10);

        h.service
            .enqueue_geocode("Atlantis", None, Priority::Low)
            .await
            .unwrap();
        let job = h.queue.take_due(Utc::now()).pop().unwrap();

        assert_eq!(h.service.process_job(&job).await.unwrap(), None);
        assert!(h.queue.is_empty());
        assert!(h.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_empty_location_is_rejected() {
        let primary = MockGeocoder::new("PRIMARY", Reply::Found(paris()));
        let h = harness(primary.clone(), None, 10);

        assert_eq!(h.service.geocode("   ", None).await, None);
        assert!(h
            .service
            .enqueue_geocode("", None, Priority::Normal)
            .await
            .is_err());
        assert_eq!(primary.calls(), 0);
    }

    fn paris_request() -> Arc<GeocodeRequest> {
        Arc::new(GeocodeRequest::new("Paris", Some("FR")))
    }

    #[tokio::test]
    async fn test_retries_charge_quota_per_call() {
        let primary = MockGeocoder::new("PRIMARY", Reply::Status(503));
        let quota = Arc::new(DailyQuota::new("PRIMARY", 10));
        let step = GeocoderStep::new(primary.clone(), registry(3), Duration::from_secs(3))
            .with_quota(quota.clone());

        let result = step.run(paris_request(), CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(ResilienceError::Transient { kind: ErrorKind::ServerError, .. })
        ));
        assert_eq!(primary.calls(), 4);
        assert_eq!(quota.quota_status().remaining, 6);
    }

    #[tokio::test]
    async fn test_quota_running_out_between_retries() {
        let primary = MockGeocoder::new("PRIMARY", Reply::Status(503));
        let quota = Arc::new(DailyQuota::new("PRIMARY", 2));
        let step = GeocoderStep::new(primary.clone(), registry(3), Duration::from_secs(3))
            .with_quota(quota.clone());

        let result = step.run(paris_request(), CancellationToken::new()).await;

        assert!(matches!(result, Err(ResilienceError::QuotaExhausted { .. })));
        assert_eq!(primary.calls(), 2);
        assert_eq!(quota.quota_status().remaining, 0);
    }

    #[tokio::test]
    async fn test_open_circuit_does_not_charge_quota() {
        let primary = MockGeocoder::new("PRIMARY", Reply::Found(paris()));
        let quota = Arc::new(DailyQuota::new("PRIMARY", 10));
        let registry = registry(0);
        for _ in 0..5 {
            registry
                .circuit_breaker()
                .record_failure("PRIMARY", ErrorKind::ServerError);
        }
        assert_eq!(registry.circuit_breaker().state("PRIMARY"), CircuitState::Open);

        let step = GeocoderStep::new(primary.clone(), registry, Duration::from_secs(3))
            .with_quota(quota.clone());
        for _ in 0..10 {
            let result = step.run(paris_request(), CancellationToken::new()).await;
            assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
        }

        assert_eq!(primary.calls(), 0);
        assert_eq!(quota.quota_status().remaining, 10);
    }

    #[tokio::test]
    async fn test_external_spent_quota_defers_without_calling() {
        let primary = MockGeocoder::new("PRIMARY", Reply::Found(paris()));
        let reset_at = Utc::now() + chrono::Duration::hours(5);
        let quota = Arc::new(SpentQuota {
            reset_at,
            consumed: AtomicUsize::new(0),
        });
        let cache = Arc::new(InMemoryCache::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let in_flight = Arc::new(InMemoryInFlight::new());
        let service = GeocodingService::with_quota(
            primary.clone(),
            None,
            stores(&cache, &queue, &in_flight),
            registry(0),
            quota.clone(),
            GeocodingConfig::default(),
        );

        assert_eq!(service.geocode("Paris", Some("FR")).await, None);

        assert_eq!(primary.calls(), 0);
        assert_eq!(quota.consumed.load(Ordering::SeqCst), 0);
        assert_eq!(service.get_quota_status().reset_at, reset_at);
        let jobs = queue.jobs();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].scheduled_at >= reset_at);
    }
}
