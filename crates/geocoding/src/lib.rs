//! Geocoding with a bounded time budget and quota-aware deferred retries.
//!
//! # Architecture
//!
//! ```text
//! geocode(location, country)
//!     |
//!     v
//! TimeoutBudgetChain (one total budget, per-step sub-deadlines)
//!     |-- cache step
//!     |-- primary geocoder  (DailyQuota + ResilienceRegistry)
//!     `-- fallback geocoder (ResilienceRegistry)
//!     |
//!     |  no result and retry worthwhile
//!     v
//! DeferredRetryScheduler --> JobQueue (durable, external)
//!     ^                          |
//!     |  process_job(job)        |
//!     `--------------------------'
//! ```
//!
//! The synchronous path never fails: problems degrade to `None`. Deferred
//! jobs are deduplicated per normalized key through an [`InFlightStore`].
//!
//! Storage and HTTP clients are collaborators supplied through the traits in
//! [`traits`]; [`memory`] provides in-process implementations.

pub mod chain;
pub mod errors;
pub mod memory;
pub mod models;
pub mod quota;
pub mod scheduler;
pub mod service;
pub mod traits;

pub use chain::{
    ChainDiagnostics, ChainMetrics, ChainOutcome, ChainStatus, FallbackStep, SkipReason,
    StepAttempt, StepOutcome, TimeoutBudgetChain,
};
pub use errors::GeocodingError;
pub use memory::{InMemoryCache, InMemoryInFlight, InMemoryJobQueue};
pub use models::{normalized_key, Coordinates, GeocodeRequest, Job, Priority, QuotaStatus, WorkItem};
pub use quota::{next_utc_midnight, DailyQuota};
pub use scheduler::{
    DeferredRetryScheduler, InFlightGuard, RetryReason, ScheduleOutcome, SchedulerConfig,
};
pub use service::{CacheStep, GeocoderStep, GeocodingConfig, GeocodingService, GeocodingStores};
pub use traits::{GeocodeCache, Geocoder, InFlightStore, JobQueue, QuotaCounter, QuotaSource};
