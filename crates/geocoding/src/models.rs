//! Data types shared by the chain, the scheduler and the service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A resolved location.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Job priority. Higher runs first when a queue supports ordering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Build the deduplication key for a place: lowercase `"city,country"` with
/// whitespace collapsed.
pub fn normalized_key(location: &str, country: Option<&str>) -> String {
    let squash = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();

    let city = squash(location);
    match country.map(squash).filter(|c| !c.is_empty()) {
        Some(country) => format!("{},{}", city, country),
        None => city,
    }
}

/// A single geocoding lookup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodeRequest {
    pub location: String,
    pub country: Option<String>,
}

impl GeocodeRequest {
    pub fn new(location: impl Into<String>, country: Option<&str>) -> Self {
        Self {
            location: location.into(),
            country: country.map(str::to_string),
        }
    }

    pub fn normalized_key(&self) -> String {
        normalized_key(&self.location, self.country.as_deref())
    }
}

/// A lookup waiting to run in the background.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    /// At most one item per key may be in flight.
    pub normalized_key: String,
    pub request: GeocodeRequest,
    pub priority: Priority,
    /// Number of deferred attempts already made.
    pub attempt: u32,
    pub scheduled_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(request: GeocodeRequest, priority: Priority) -> Self {
        Self {
            normalized_key: request.normalized_key(),
            request,
            priority,
            attempt: 0,
            scheduled_at: Utc::now(),
        }
    }
}

/// Snapshot of a quota-gated provider's allowance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    pub remaining: u64,
    pub limit: u64,
    pub reset_at: DateTime<Utc>,
}

impl QuotaStatus {
    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}

/// Durable queue entry.
///
/// `attempt` travels with the job so the backoff step survives restarts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub target_operation: String,
    pub args: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
    pub attempt: u32,
    pub priority: Priority,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_key() {
        assert_eq!(normalized_key("  New   York ", Some("US")), "new york,us");
        assert_eq!(normalized_key("Paris", None), "paris");
        assert_eq!(normalized_key("Paris", Some("  ")), "paris");
    }

    #[test]
    fn test_same_place_same_key() {
        let a = GeocodeRequest::new("Berlin", Some("DE"));
        let b = GeocodeRequest::new("berlin ", Some("de"));
        assert_eq!(a.normalized_key(), b.normalized_key());
    }

    #[test]
    fn test_work_item_serializes_camel_case() {
        let item = WorkItem::new(GeocodeRequest::new("Oslo", Some("NO")), Priority::High);
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["normalizedKey"], "oslo,no");
        assert_eq!(json["priority"], "high");

        let back: WorkItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }
}
