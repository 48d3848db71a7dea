//! Rate Limiter, Backoff Tracker & Kill Switch
//!
//! Per-tenant/per-phone token buckets keyed by time window
//! (`rate:tenant:<id>:<window>:<bucket>` / `rate:phone:<id>:<window>:<bucket>`),
//! per-campaign backoff deadlines caused by upstream 429s
//! (`campaign:backoff:<id>`), and the process-wide persisted kill switch
//! (`platform:killswitch`). Backed by Redis INCR+EXPIRE in production, with
//! in-memory equivalents for development and tests.

use chrono::{Datelike, TimeZone, Utc};
use std::time::Duration;
use thiserror::Error;

pub mod backoff;
pub mod killswitch;
pub mod memory;
pub mod redis_impl;

pub use backoff::BackoffTracker;
pub use killswitch::KillSwitch;
pub use memory::{MemoryBackoffTracker, MemoryKillSwitch, MemoryRateLimiter};
pub use redis_impl::{RedisBackoffTracker, RedisKillSwitch, RedisRateLimiter};

#[derive(Error, Debug)]
pub enum LimitsError {
    #[error("Rate store error: {0}")]
    Store(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

impl From<::redis::RedisError> for LimitsError {
    fn from(err: ::redis::RedisError) -> Self {
        LimitsError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LimitsError>;

/// Which window rejected the send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowLevel {
    Second,
    Minute,
    Day,
    Month,
}

/// Outcome of a rate check. `retry_after` is the hint handed back to the
/// queue when the send must wait.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after: Option<Duration>,
    pub exceeded: Option<WindowLevel>,
}

impl RateDecision {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after: None,
            exceeded: None,
        }
    }

    pub fn denied(level: WindowLevel, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after: Some(retry_after),
            exceeded: Some(level),
        }
    }
}

/// Effective caps for one tenant/phone pair. Burst caps default globally;
/// daily/monthly come from the plan (and tier) and may be unlimited.
#[derive(Debug, Clone, Copy)]
pub struct TenantCaps {
    pub per_second: u64,
    pub per_minute: u64,
    pub per_day: Option<u64>,
    pub per_month: Option<u64>,
}

impl Default for TenantCaps {
    fn default() -> Self {
        Self {
            per_second: 50,
            per_minute: 1_000,
            per_day: None,
            per_month: None,
        }
    }
}

impl TenantCaps {
    /// Plan quota combined with the messaging-tier hard cap; the tighter of
    /// the two bounds the day window.
    pub fn with_daily(mut self, plan_daily: Option<u64>, tier_daily: Option<u64>) -> Self {
        self.per_day = match (plan_daily, tier_daily) {
            (Some(p), Some(t)) => Some(p.min(t)),
            (Some(p), None) => Some(p),
            (None, Some(t)) => Some(t),
            (None, None) => None,
        };
        self
    }

    pub fn with_monthly(mut self, monthly: Option<u64>) -> Self {
        self.per_month = monthly;
        self
    }
}

/// The limiter seam consumed by the batch worker and the send pipeline.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one intended send against every window for both the tenant and
    /// the phone bucket, and decide. Denials still consume the slot; the
    /// caller retries after the hint.
    async fn check_and_consume(
        &self,
        tenant_id: &str,
        phone_number_id: &str,
        caps: &TenantCaps,
    ) -> Result<RateDecision>;
}

/// Seconds remaining in the current window, used as the retry hint.
pub(crate) fn window_retry_after(level: WindowLevel) -> Duration {
    let now = Utc::now();
    match level {
        WindowLevel::Second => Duration::from_secs(1),
        WindowLevel::Minute => {
            let into = now.timestamp() % 60;
            Duration::from_secs((60 - into).max(1) as u64)
        }
        WindowLevel::Day => {
            let midnight = Utc
                .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
                .single()
                .map(|d| d + chrono::Duration::days(1))
                .unwrap_or(now);
            Duration::from_secs((midnight - now).num_seconds().max(1) as u64)
        }
        WindowLevel::Month => {
            let (year, month) = if now.month() == 12 {
                (now.year() + 1, 1)
            } else {
                (now.year(), now.month() + 1)
            };
            let next_month = Utc
                .with_ymd_and_hms(year, month, 1, 0, 0, 0)
                .single()
                .unwrap_or(now);
            Duration::from_secs((next_month - now).num_seconds().max(1) as u64)
        }
    }
}

/// Bucket key suffix for a window at the current instant.
pub(crate) fn window_bucket(level: WindowLevel) -> String {
    let now = Utc::now();
    match level {
        WindowLevel::Second => format!("second:{}", now.timestamp()),
        WindowLevel::Minute => format!("minute:{}", now.timestamp() / 60),
        WindowLevel::Day => format!("day:{}", now.format("%Y-%m-%d")),
        WindowLevel::Month => format!("month:{}", now.format("%Y-%m")),
    }
}

/// Seconds a window's counter key lives past its bucket.
pub(crate) fn window_expiry(level: WindowLevel) -> u64 {
    match level {
        WindowLevel::Second => 2,
        WindowLevel::Minute => 120,
        WindowLevel::Day => 60 * 60 * 26,
        WindowLevel::Month => 60 * 60 * 24 * 32,
    }
}

// ============================================================================
// Auto-pause policy
// ============================================================================

/// Tunables for the failure-driven auto-pause. Both the consecutive-failure
/// counter and the cumulative failure rate are live signals.
#[derive(Debug, Clone, Copy)]
pub struct FailurePolicy {
    pub max_consecutive_failures: u32,
    pub failure_rate_threshold: f64,
    /// The rate signal only fires once this many messages were processed.
    pub min_processed_for_rate: u64,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 10,
            failure_rate_threshold: 0.30,
            min_processed_for_rate: 50,
        }
    }
}

impl FailurePolicy {
    pub fn consecutive_exceeded(&self, consecutive_failures: u32) -> bool {
        consecutive_failures >= self.max_consecutive_failures
    }

    pub fn rate_exceeded(&self, sent: u64, failed: u64) -> bool {
        let processed = sent + failed;
        if processed < self.min_processed_for_rate {
            return false;
        }
        (failed as f64 / processed as f64) >= self.failure_rate_threshold
    }

    pub fn should_auto_pause(&self, consecutive_failures: u32, sent: u64, failed: u64) -> bool {
        self.consecutive_exceeded(consecutive_failures) || self.rate_exceeded(sent, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_take_the_tighter_daily_bound() {
        let caps = TenantCaps::default().with_daily(Some(10_000), Some(1_000));
        assert_eq!(caps.per_day, Some(1_000));

        let caps = TenantCaps::default().with_daily(None, Some(250));
        assert_eq!(caps.per_day, Some(250));

        let caps = TenantCaps::default().with_daily(Some(1_000), None);
        assert_eq!(caps.per_day, Some(1_000));

        let caps = TenantCaps::default().with_daily(None, None);
        assert_eq!(caps.per_day, None);
    }

    #[test]
    fn failure_policy_thresholds() {
        let policy = FailurePolicy::default();

        assert!(!policy.should_auto_pause(9, 0, 0));
        assert!(policy.should_auto_pause(10, 0, 0));

        // Below the processed floor the rate never fires.
        assert!(!policy.should_auto_pause(0, 10, 39));
        // 15/50 = 30%
        assert!(policy.should_auto_pause(0, 35, 15));
        // 14/50 = 28%
        assert!(!policy.should_auto_pause(0, 36, 14));
    }

    #[test]
    fn retry_hints_are_positive() {
        for level in [
            WindowLevel::Second,
            WindowLevel::Minute,
            WindowLevel::Day,
            WindowLevel::Month,
        ] {
            assert!(window_retry_after(level) >= Duration::from_secs(1));
        }
    }
}
