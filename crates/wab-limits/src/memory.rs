//! In-Memory Backends
//!
//! Dev/test equivalents of the Redis limiter, backoff tracker and kill
//! switch with the same window semantics.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

use crate::backoff::BackoffTracker;
use crate::killswitch::KillSwitch;
use crate::{
    window_bucket, window_retry_after, RateDecision, RateLimiter, Result, TenantCaps, WindowLevel,
};

#[derive(Default)]
pub struct MemoryRateLimiter {
    counters: DashMap<String, u64>,
}

impl MemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, key: String) -> u64 {
        let mut entry = self.counters.entry(key).or_insert(0);
        *entry += 1;
        *entry
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn check_and_consume(
        &self,
        tenant_id: &str,
        phone_number_id: &str,
        caps: &TenantCaps,
    ) -> Result<RateDecision> {
        let windows: [(WindowLevel, Option<u64>); 4] = [
            (WindowLevel::Second, Some(caps.per_second)),
            (WindowLevel::Minute, Some(caps.per_minute)),
            (WindowLevel::Day, caps.per_day),
            (WindowLevel::Month, caps.per_month),
        ];

        for (level, cap) in windows {
            let Some(cap) = cap else { continue };
            let bucket = window_bucket(level);

            let tenant_count = self.bump(format!("rate:tenant:{tenant_id}:{bucket}"));
            let phone_count = self.bump(format!("rate:phone:{phone_number_id}:{bucket}"));

            if tenant_count > cap || phone_count > cap {
                return Ok(RateDecision::denied(level, window_retry_after(level)));
            }
        }

        Ok(RateDecision::allowed())
    }
}

#[derive(Default)]
pub struct MemoryBackoffTracker {
    deadlines: DashMap<String, Instant>,
}

impl MemoryBackoffTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackoffTracker for MemoryBackoffTracker {
    async fn set_backoff(&self, campaign_id: &str, wait: Duration) -> Result<()> {
        self.deadlines
            .insert(campaign_id.to_string(), Instant::now() + wait);
        Ok(())
    }

    async fn should_wait(&self, campaign_id: &str) -> Result<Option<Duration>> {
        let Some(deadline) = self.deadlines.get(campaign_id).map(|d| *d) else {
            return Ok(None);
        };
        let now = Instant::now();
        if deadline <= now {
            self.deadlines.remove(campaign_id);
            return Ok(None);
        }
        Ok(Some(deadline - now))
    }

    async fn clear(&self, campaign_id: &str) -> Result<()> {
        self.deadlines.remove(campaign_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryKillSwitch {
    reason: Mutex<Option<String>>,
}

impl MemoryKillSwitch {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KillSwitch for MemoryKillSwitch {
    async fn activate(&self, reason: &str) -> Result<()> {
        *self.reason.lock() = Some(reason.to_string());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.reason.lock() = None;
        Ok(())
    }

    async fn status(&self) -> Result<Option<String>> {
        Ok(self.reason.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn limiter_denies_over_cap_and_reports_level() {
        let limiter = MemoryRateLimiter::new();
        let caps = TenantCaps {
            per_second: 1_000,
            per_minute: 3,
            per_day: None,
            per_month: None,
        };

        for _ in 0..3 {
            let decision = limiter.check_and_consume("t1", "p1", &caps).await.unwrap();
            assert!(decision.allowed);
        }
        let denied = limiter.check_and_consume("t1", "p1", &caps).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.exceeded, Some(WindowLevel::Minute));
        assert!(denied.retry_after.unwrap() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn limiter_buckets_are_per_tenant() {
        let limiter = MemoryRateLimiter::new();
        let caps = TenantCaps {
            per_second: 1_000,
            per_minute: 1,
            per_day: None,
            per_month: None,
        };

        assert!(limiter.check_and_consume("t1", "p1", &caps).await.unwrap().allowed);
        assert!(!limiter.check_and_consume("t1", "p1", &caps).await.unwrap().allowed);
        // Another tenant/phone pair is untouched.
        assert!(limiter.check_and_consume("t2", "p2", &caps).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn day_cap_applies_when_set() {
        let limiter = MemoryRateLimiter::new();
        let caps = TenantCaps::default().with_daily(Some(2), None);

        assert!(limiter.check_and_consume("t1", "p1", &caps).await.unwrap().allowed);
        assert!(limiter.check_and_consume("t1", "p1", &caps).await.unwrap().allowed);
        let denied = limiter.check_and_consume("t1", "p1", &caps).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.exceeded, Some(WindowLevel::Day));
    }

    #[tokio::test]
    async fn backoff_deadline_counts_down() {
        let tracker = MemoryBackoffTracker::new();
        assert!(tracker.should_wait("c1").await.unwrap().is_none());

        tracker
            .set_backoff("c1", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(tracker.should_wait("c1").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(tracker.should_wait("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn kill_switch_round_trip() {
        let switch = MemoryKillSwitch::new();
        assert!(switch.status().await.unwrap().is_none());

        switch.activate("incident drill").await.unwrap();
        assert_eq!(
            switch.status().await.unwrap().as_deref(),
            Some("incident drill")
        );

        switch.clear().await.unwrap();
        assert!(switch.status().await.unwrap().is_none());
    }
}
