//! Redis Backends
//!
//! INCR+EXPIRE window counters for the rate limiter, a timestamp value for
//! the backoff deadline, and a plain string key for the kill switch.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::debug;

use crate::backoff::{backoff_key, BackoffTracker};
use crate::killswitch::{KillSwitch, KILL_SWITCH_KEY};
use crate::{
    window_bucket, window_expiry, window_retry_after, LimitsError, RateDecision, RateLimiter,
    Result, TenantCaps, WindowLevel,
};

async fn connect(redis_url: &str) -> Result<ConnectionManager> {
    let client =
        redis::Client::open(redis_url).map_err(|e| LimitsError::Connection(e.to_string()))?;
    ConnectionManager::new(client)
        .await
        .map_err(|e| LimitsError::Connection(e.to_string()))
}

pub struct RedisRateLimiter {
    conn: ConnectionManager,
}

impl RedisRateLimiter {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        Ok(Self {
            conn: connect(redis_url).await?,
        })
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// INCR the window counter, arming the expiry on first increment.
    async fn bump(&self, conn: &mut ConnectionManager, key: &str, level: WindowLevel) -> Result<u64> {
        let count: u64 = redis::cmd("INCR").arg(key).query_async(conn).await?;
        if count == 1 {
            let _: () = redis::cmd("EXPIRE")
                .arg(key)
                .arg(window_expiry(level))
                .query_async(conn)
                .await?;
        }
        Ok(count)
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check_and_consume(
        &self,
        tenant_id: &str,
        phone_number_id: &str,
        caps: &TenantCaps,
    ) -> Result<RateDecision> {
        let mut conn = self.conn.clone();

        let windows: [(WindowLevel, Option<u64>); 4] = [
            (WindowLevel::Second, Some(caps.per_second)),
            (WindowLevel::Minute, Some(caps.per_minute)),
            (WindowLevel::Day, caps.per_day),
            (WindowLevel::Month, caps.per_month),
        ];

        for (level, cap) in windows {
            let Some(cap) = cap else { continue };
            let bucket = window_bucket(level);

            let tenant_key = format!("rate:tenant:{tenant_id}:{bucket}");
            let phone_key = format!("rate:phone:{phone_number_id}:{bucket}");

            let tenant_count = self.bump(&mut conn, &tenant_key, level).await?;
            let phone_count = self.bump(&mut conn, &phone_key, level).await?;

            if tenant_count > cap || phone_count > cap {
                debug!(
                    tenant_id = %tenant_id,
                    phone_number_id = %phone_number_id,
                    level = ?level,
                    cap = cap,
                    "Rate window exceeded"
                );
                return Ok(RateDecision::denied(level, window_retry_after(level)));
            }
        }

        Ok(RateDecision::allowed())
    }
}

pub struct RedisBackoffTracker {
    conn: ConnectionManager,
}

impl RedisBackoffTracker {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        Ok(Self {
            conn: connect(redis_url).await?,
        })
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl BackoffTracker for RedisBackoffTracker {
    async fn set_backoff(&self, campaign_id: &str, wait: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let deadline_ms = chrono::Utc::now().timestamp_millis() + wait.as_millis() as i64;
        // The key expires with the deadline, so a stale campaign leaves no
        // residue.
        let _: () = redis::cmd("SET")
            .arg(backoff_key(campaign_id))
            .arg(deadline_ms)
            .arg("PX")
            .arg(wait.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn should_wait(&self, campaign_id: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn.clone();
        let deadline_ms: Option<i64> = redis::cmd("GET")
            .arg(backoff_key(campaign_id))
            .query_async(&mut conn)
            .await?;
        let Some(deadline_ms) = deadline_ms else {
            return Ok(None);
        };
        let remaining = deadline_ms - chrono::Utc::now().timestamp_millis();
        if remaining <= 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_millis(remaining as u64)))
    }

    async fn clear(&self, campaign_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(backoff_key(campaign_id))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

pub struct RedisKillSwitch {
    conn: ConnectionManager,
}

impl RedisKillSwitch {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        Ok(Self {
            conn: connect(redis_url).await?,
        })
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl KillSwitch for RedisKillSwitch {
    async fn activate(&self, reason: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(KILL_SWITCH_KEY)
            .arg(reason)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(KILL_SWITCH_KEY)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn status(&self) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let reason: Option<String> = redis::cmd("GET")
            .arg(KILL_SWITCH_KEY)
            .query_async(&mut conn)
            .await?;
        Ok(reason)
    }
}
