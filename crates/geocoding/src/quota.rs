//! Daily call quota for a hard-limited provider.
//!
//! The allowance resets at UTC midnight.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use log::{info, warn};

use crate::models::QuotaStatus;
use crate::traits::{QuotaCounter, QuotaSource};

/// Default daily allowance.
const DEFAULT_DAILY_LIMIT: u64 = 2_500;

#[derive(Debug)]
struct QuotaWindow {
    /// Day the counter belongs to; set on first use.
    day: Option<NaiveDate>,
    used: u64,
}

/// Counts calls against a daily limit.
#[derive(Debug)]
pub struct DailyQuota {
    provider: String,
    limit: u64,
    window: Mutex<QuotaWindow>,
}

impl DailyQuota {
    pub fn new(provider: impl Into<String>, limit: u64) -> Self {
        Self {
            provider: provider.into(),
            limit,
            window: Mutex::new(QuotaWindow { day: None, used: 0 }),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    fn lock(&self) -> MutexGuard<'_, QuotaWindow> {
        self.window.lock().unwrap_or_else(|poisoned| {
            warn!("Quota mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Start a new window if `now` is on a later day.
    fn roll(&self, window: &mut QuotaWindow, now: DateTime<Utc>) {
        let today = now.date_naive();
        match window.day {
            Some(day) if today <= day => {}
            previous => {
                if previous.is_some() && window.used > 0 {
                    info!(
                        "Quota: '{}' reset for {} ({} used previously)",
                        self.provider, today, window.used
                    );
                }
                window.day = Some(today);
                window.used = 0;
            }
        }
    }

    /// Take one call from today's allowance.
    pub fn try_consume(&self) -> bool {
        self.try_consume_at(Utc::now())
    }

    pub fn try_consume_at(&self, now: DateTime<Utc>) -> bool {
        let mut window = self.lock();
        self.roll(&mut window, now);
        if window.used >= self.limit {
            return false;
        }
        window.used += 1;
        true
    }

    /// Treat today's allowance as spent, e.g. after the provider itself
    /// reported the quota exceeded.
    pub fn mark_exhausted(&self) {
        self.mark_exhausted_at(Utc::now());
    }

    pub fn mark_exhausted_at(&self, now: DateTime<Utc>) {
        let mut window = self.lock();
        self.roll(&mut window, now);
        if window.used < self.limit {
            warn!("Quota: '{}' reported exhausted by provider", self.provider);
        }
        window.used = self.limit;
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> QuotaStatus {
        let mut window = self.lock();
        self.roll(&mut window, now);
        QuotaStatus {
            remaining: self.limit.saturating_sub(window.used),
            limit: self.limit,
            reset_at: next_utc_midnight(now),
        }
    }
}

impl Default for DailyQuota {
    fn default() -> Self {
        Self::new("geocoder", DEFAULT_DAILY_LIMIT)
    }
}

impl QuotaSource for DailyQuota {
    fn quota_status(&self) -> QuotaStatus {
        self.status_at(Utc::now())
    }
}

impl QuotaCounter for DailyQuota {
    fn try_consume(&self) -> bool {
        self.try_consume_at(Utc::now())
    }

    fn mark_exhausted(&self) {
        self.mark_exhausted_at(Utc::now());
    }
}

/// The first instant of the next UTC day.
pub fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    match now.date_naive().succ_opt() {
        Some(tomorrow) => tomorrow.and_time(NaiveTime::MIN).and_utc(),
        None => now + Duration::days(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_consume_until_exhausted() {
        let quota = DailyQuota::new("nominatim", 2);
        let now = at(10, 12);

        assert!(quota.try_consume_at(now));
        assert!(quota.try_consume_at(now));
        assert!(!quota.try_consume_at(now));

        let status = quota.status_at(now);
        assert_eq!(status.remaining, 0);
        assert!(status.is_exhausted());
        assert_eq!(status.reset_at, at(11, 0));
    }

    #[test]
    fn test_resets_at_midnight() {
        let quota = DailyQuota::new("nominatim", 1);
        assert!(quota.try_consume_at(at(10, 23)));
        assert!(!quota.try_consume_at(at(10, 23)));

        assert!(quota.try_consume_at(at(11, 0)));
        assert_eq!(quota.status_at(at(11, 1)).remaining, 0);
    }

    #[test]
    fn test_mark_exhausted() {
        let quota = DailyQuota::new("nominatim", 100);
        quota.mark_exhausted_at(at(10, 8));
        assert_eq!(quota.status_at(at(10, 9)).remaining, 0);
        assert_eq!(quota.status_at(at(11, 9)).remaining, 100);
    }

    #[test]
    fn test_next_midnight() {
        assert_eq!(next_utc_midnight(at(31, 0)), Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
    }
}
