//! Distributed Campaign Execution Lock
//!
//! A per-campaign lease in Redis guaranteeing at most one active
//! orchestrator per campaign:
//! - SET NX with expiry for atomic acquisition
//! - Owner-verified release and extend via Lua check-and-act scripts
//! - Force release for admin override
//! - SCAN-based listing of active leases
//!
//! The lock value records hostname and pid for forensics only; owner
//! identity alone authorizes release and extension, so the lease survives
//! process restarts that keep the owner id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod error;
pub mod memory;

pub use error::{LockError, Result};
pub use memory::MemoryExecutionLock;

pub const LOCK_KEY_PREFIX: &str = "campaign:lock:execution:";

/// Hard upper bound on a lease; holders extend opportunistically well
/// before this.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// JSON value stored under the lock key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockOwner {
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub hostname: String,
    pub pid: u32,
}

impl LockOwner {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            acquired_at: Utc::now(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
        }
    }
}

/// Result of an acquire attempt.
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    Acquired,
    /// Lock is held; carries the current owner for diagnostics.
    AlreadyHeld { existing: LockOwner },
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, AcquireOutcome::Acquired)
    }
}

#[derive(Debug, Clone)]
pub enum ReleaseOutcome {
    Released,
    /// Nothing was held.
    NotHeld,
    /// Held by a different owner and `force` was not set.
    OwnerMismatch { existing: LockOwner },
}

#[derive(Debug, Clone)]
pub struct LockStatus {
    pub locked: bool,
    pub owner: Option<LockOwner>,
    pub ttl_remaining: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ActiveLock {
    pub campaign_id: String,
    pub owner: LockOwner,
    pub ttl_remaining: Option<Duration>,
}

/// The execution-lease seam. The engine depends on this trait; production
/// uses Redis, dev mode and tests use the in-memory implementation.
#[async_trait]
pub trait ExecutionLock: Send + Sync {
    async fn acquire(
        &self,
        campaign_id: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<AcquireOutcome>;

    async fn release(&self, campaign_id: &str, owner_id: &str, force: bool)
        -> Result<ReleaseOutcome>;

    async fn check(&self, campaign_id: &str) -> Result<LockStatus>;

    /// Refresh the lease TTL; fails (false) unless `owner_id` matches.
    async fn extend(&self, campaign_id: &str, owner_id: &str, ttl: Duration) -> Result<bool>;

    async fn list_active(&self) -> Result<Vec<ActiveLock>>;
}

fn lock_key(campaign_id: &str) -> String {
    format!("{LOCK_KEY_PREFIX}{campaign_id}")
}

/// Redis-backed execution lock.
pub struct RedisExecutionLock {
    conn: ConnectionManager,
}

impl RedisExecutionLock {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| LockError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| LockError::Connection(e.to_string()))?;
        Ok(Self { conn })
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn read_owner(
        &self,
        conn: &mut ConnectionManager,
        key: &str,
    ) -> Result<Option<LockOwner>> {
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(conn).await?;
        match value {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ExecutionLock for RedisExecutionLock {
    async fn acquire(
        &self,
        campaign_id: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<AcquireOutcome> {
        let mut conn = self.conn.clone();
        let key = lock_key(campaign_id);
        let owner = LockOwner::new(owner_id);
        let value = serde_json::to_string(&owner)?;

        // SET key value NX EX seconds
        let result: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        if result.is_some() {
            info!(campaign_id = %campaign_id, owner_id = %owner_id, "Acquired execution lock");
            return Ok(AcquireOutcome::Acquired);
        }

        match self.read_owner(&mut conn, &key).await? {
            Some(existing) => {
                debug!(
                    campaign_id = %campaign_id,
                    held_by = %existing.owner_id,
                    "Execution lock already held"
                );
                Ok(AcquireOutcome::AlreadyHeld { existing })
            }
            // Expired between SET and GET; report held-by-unknown rather
            // than pretending we won.
            None => Ok(AcquireOutcome::AlreadyHeld {
                existing: LockOwner::new("unknown"),
            }),
        }
    }

    async fn release(
        &self,
        campaign_id: &str,
        owner_id: &str,
        force: bool,
    ) -> Result<ReleaseOutcome> {
        let mut conn = self.conn.clone();
        let key = lock_key(campaign_id);

        if force {
            let deleted: i64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
            warn!(campaign_id = %campaign_id, owner_id = %owner_id, "Force-released execution lock");
            return Ok(if deleted > 0 {
                ReleaseOutcome::Released
            } else {
                ReleaseOutcome::NotHeld
            });
        }

        let Some(existing) = self.read_owner(&mut conn, &key).await? else {
            return Ok(ReleaseOutcome::NotHeld);
        };
        if existing.owner_id != owner_id {
            return Ok(ReleaseOutcome::OwnerMismatch { existing });
        }

        // Atomic check-and-delete keyed on the full stored value.
        let script = r#"
            local current = redis.call("GET", KEYS[1])
            if current then
                local owner = cjson.decode(current)
                if owner["ownerId"] == ARGV[1] then
                    redis.call("DEL", KEYS[1])
                    return 1
                end
            end
            return 0
        "#;
        let released: i32 = redis::Script::new(script)
            .key(&key)
            .arg(owner_id)
            .invoke_async(&mut conn)
            .await?;

        if released == 1 {
            info!(campaign_id = %campaign_id, owner_id = %owner_id, "Released execution lock");
            Ok(ReleaseOutcome::Released)
        } else {
            // Raced with expiry or takeover between GET and script.
            match self.read_owner(&mut conn, &key).await? {
                Some(existing) => Ok(ReleaseOutcome::OwnerMismatch { existing }),
                None => Ok(ReleaseOutcome::NotHeld),
            }
        }
    }

    async fn check(&self, campaign_id: &str) -> Result<LockStatus> {
        let mut conn = self.conn.clone();
        let key = lock_key(campaign_id);

        let owner = self.read_owner(&mut conn, &key).await?;
        if owner.is_none() {
            return Ok(LockStatus {
                locked: false,
                owner: None,
                ttl_remaining: None,
            });
        }

        let ttl: i64 = redis::cmd("TTL").arg(&key).query_async(&mut conn).await?;
        Ok(LockStatus {
            locked: true,
            owner,
            ttl_remaining: (ttl > 0).then(|| Duration::from_secs(ttl as u64)),
        })
    }

    async fn extend(&self, campaign_id: &str, owner_id: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let key = lock_key(campaign_id);

        // Atomic check-and-extend: only the owner refreshes the lease.
        let script = r#"
            local current = redis.call("GET", KEYS[1])
            if current then
                local owner = cjson.decode(current)
                if owner["ownerId"] == ARGV[1] then
                    redis.call("EXPIRE", KEYS[1], ARGV[2])
                    return 1
                end
            end
            return 0
        "#;
        let extended: i32 = redis::Script::new(script)
            .key(&key)
            .arg(owner_id)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn list_active(&self) -> Result<Vec<ActiveLock>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{LOCK_KEY_PREFIX}*");
        let mut cursor: u64 = 0;
        let mut locks = Vec::new();

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            for key in keys {
                let Some(owner) = self.read_owner(&mut conn, &key).await? else {
                    continue;
                };
                let ttl: i64 = redis::cmd("TTL").arg(&key).query_async(&mut conn).await?;
                locks.push(ActiveLock {
                    campaign_id: key
                        .strip_prefix(LOCK_KEY_PREFIX)
                        .unwrap_or(&key)
                        .to_string(),
                    owner,
                    ttl_remaining: (ttl > 0).then(|| Duration::from_secs(ttl as u64)),
                });
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(locks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_layout() {
        assert_eq!(lock_key("abc"), "campaign:lock:execution:abc");
    }

    #[test]
    fn owner_carries_forensics() {
        let owner = LockOwner::new("worker-1");
        assert_eq!(owner.owner_id, "worker-1");
        assert!(owner.pid > 0);
    }
}
