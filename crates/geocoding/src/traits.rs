//! Collaborator interfaces.
//!
//! The geocoding layer does not own its cache, queue, quota counter or HTTP
//! clients. Implement these traits to plug them in; [`crate::memory`] has
//! in-process versions.

use std::time::Duration;

use async_trait::async_trait;
use enrichment_resilience::ProviderError;
use tokio_util::sync::CancellationToken;

use crate::errors::GeocodingError;
use crate::models::{Coordinates, Job, QuotaStatus};

/// Cache of resolved places keyed by normalized key.
#[async_trait]
pub trait GeocodeCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Coordinates>;

    async fn set(&self, key: &str, value: Coordinates, ttl: Duration);
}

/// Durable queue that runs jobs at a given time.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Persist `job` to run at `job.scheduled_at`. Metadata, including the
    /// attempt counter, must survive restarts.
    async fn enqueue_at(&self, job: Job) -> Result<(), GeocodingError>;
}

/// Read-only view of a quota-gated provider's allowance.
pub trait QuotaSource: Send + Sync {
    fn quota_status(&self) -> QuotaStatus;
}

/// A quota that provider calls are charged against.
///
/// Back it with durable storage, or with the provider's own usage report,
/// so the count survives restarts. [`crate::quota::DailyQuota`] is the
/// in-process version.
pub trait QuotaCounter: QuotaSource {
    /// Charge one call. Returns false, charging nothing, when none are left.
    fn try_consume(&self) -> bool;

    /// The provider reported the quota spent; treat it as empty until reset.
    fn mark_exhausted(&self);
}

/// Set of keys with an active attempt.
///
/// A durable implementation lets the invariant hold across restarts.
pub trait InFlightStore: Send + Sync {
    /// Mark `key` in flight. Returns false if it already was.
    fn try_mark(&self, key: &str) -> bool;

    fn release(&self, key: &str);

    fn contains(&self, key: &str) -> bool;
}

/// A geocoding provider.
///
/// # Example
///
/// ```ignore
/// use async_trait::async_trait;
/// use enrichment_geocoding::{Coordinates, Geocoder};
///
/// struct Nominatim {
///     client: reqwest::Client,
/// }
///
/// #[async_trait]
/// impl Geocoder for Nominatim {
///     fn id(&self) -> &'static str {
///         "NOMINATIM"
///     }
///
///     async fn geocode(
///         &self,
///         location: &str,
///         country: Option<&str>,
///         cancel: CancellationToken,
///     ) -> Result<Option<Coordinates>, ProviderError> {
///         // ... issue the request, racing it against `cancel.cancelled()`
///     }
/// }
/// ```
#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Provider name used for rate limiting and circuit tracking.
    fn id(&self) -> &'static str;

    /// Resolve a place. `Ok(None)` means the provider answered but knows no
    /// such place.
    ///
    /// `cancel` fires when the caller stops waiting. Implementations should
    /// stop work promptly when it does; any result produced afterwards is
    /// discarded.
    async fn geocode(
        &self,
        location: &str,
        country: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<Option<Coordinates>, ProviderError>;
}
