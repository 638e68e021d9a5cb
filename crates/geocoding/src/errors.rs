//! Error types for the geocoding crate.

use enrichment_resilience::ResilienceError;
use thiserror::Error;

/// Errors surfaced by the deferred-job side of geocoding.
///
/// The synchronous lookup path never returns these; it degrades to "no
/// result" instead.
#[derive(Error, Debug)]
pub enum GeocodingError {
    /// A protected provider call failed.
    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    /// The durable queue rejected a job.
    #[error("Queue error: {0}")]
    Queue(String),

    /// A job could not be interpreted.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Job arguments failed to (de)serialize.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
