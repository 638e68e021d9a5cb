//! In-process collaborator implementations.
//!
//! Suitable for tests and single-process deployments. State does not
//! survive a restart.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use log::warn;

use crate::errors::GeocodingError;
use crate::models::{Coordinates, Job};
use crate::traits::{GeocodeCache, InFlightStore, JobQueue};

/// TTL cache backed by a concurrent map.
#[derive(Default)]
pub struct InMemoryCache {
    entries: DashMap<String, (Coordinates, Instant)>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl GeocodeCache for InMemoryCache {
    async fn get(&self, key: &str) -> Option<Coordinates> {
        let (value, expires_at) = *self.entries.get(key)?;
        if Instant::now() >= expires_at {
            self.entries.remove(key);
            return None;
        }
        Some(value)
    }

    async fn set(&self, key: &str, value: Coordinates, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries.insert(key.to_string(), (value, expires_at));
    }
}

/// Job queue held in memory. Jobs are handed out by [`take_due`](Self::take_due).
#[derive(Default)]
pub struct InMemoryJobQueue {
    jobs: Mutex<Vec<Job>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Job>> {
        self.jobs.lock().unwrap_or_else(|poisoned| {
            warn!("Job queue mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Snapshot of every pending job.
    pub fn jobs(&self) -> Vec<Job> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove and return jobs due at `now`, earliest first, higher priority
    /// first among equal times.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<Job> {
        let mut jobs = self.lock();
        let (mut due, pending): (Vec<Job>, Vec<Job>) =
            jobs.drain(..).partition(|job| job.scheduled_at <= now);
        *jobs = pending;

        due.sort_by(|a, b| {
            a.scheduled_at
                .cmp(&b.scheduled_at)
                .then_with(|| b.priority.cmp(&a.priority))
        });
        due
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue_at(&self, job: Job) -> Result<(), GeocodingError> {
        self.lock().push(job);
        Ok(())
    }
}

/// In-flight key set.
#[derive(Default)]
pub struct InMemoryInFlight {
    keys: DashSet<String>,
}

impl InMemoryInFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl InFlightStore for InMemoryInFlight {
    fn try_mark(&self, key: &str) -> bool {
        self.keys.insert(key.to_string())
    }

    fn release(&self, key: &str) {
        self.keys.remove(key);
    }

    fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}
