//! In-memory execution lock for development mode and tests.
//!
//! Mirrors the Redis semantics including TTL expiry, owner-verified
//! release/extend and force release.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::{
    AcquireOutcome, ActiveLock, ExecutionLock, LockOwner, LockStatus, ReleaseOutcome, Result,
};

struct Lease {
    owner: LockOwner,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryExecutionLock {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryExecutionLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(leases: &mut HashMap<String, Lease>) {
        let now = Instant::now();
        leases.retain(|_, lease| lease.expires_at > now);
    }
}

#[async_trait]
impl ExecutionLock for MemoryExecutionLock {
    async fn acquire(
        &self,
        campaign_id: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<AcquireOutcome> {
        let mut leases = self.leases.lock();
        Self::prune(&mut leases);

        if let Some(existing) = leases.get(campaign_id) {
            return Ok(AcquireOutcome::AlreadyHeld {
                existing: existing.owner.clone(),
            });
        }

        leases.insert(
            campaign_id.to_string(),
            Lease {
                owner: LockOwner::new(owner_id),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(AcquireOutcome::Acquired)
    }

    async fn release(
        &self,
        campaign_id: &str,
        owner_id: &str,
        force: bool,
    ) -> Result<ReleaseOutcome> {
        let mut leases = self.leases.lock();
        Self::prune(&mut leases);

        match leases.get(campaign_id) {
            None => Ok(ReleaseOutcome::NotHeld),
            Some(lease) if force || lease.owner.owner_id == owner_id => {
                leases.remove(campaign_id);
                Ok(ReleaseOutcome::Released)
            }
            Some(lease) => Ok(ReleaseOutcome::OwnerMismatch {
                existing: lease.owner.clone(),
            }),
        }
    }

    async fn check(&self, campaign_id: &str) -> Result<LockStatus> {
        let mut leases = self.leases.lock();
        Self::prune(&mut leases);

        match leases.get(campaign_id) {
            Some(lease) => Ok(LockStatus {
                locked: true,
                owner: Some(lease.owner.clone()),
                ttl_remaining: Some(lease.expires_at.saturating_duration_since(Instant::now())),
            }),
            None => Ok(LockStatus {
                locked: false,
                owner: None,
                ttl_remaining: None,
            }),
        }
    }

    async fn extend(&self, campaign_id: &str, owner_id: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock();
        Self::prune(&mut leases);

        match leases.get_mut(campaign_id) {
            Some(lease) if lease.owner.owner_id == owner_id => {
                lease.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_active(&self) -> Result<Vec<ActiveLock>> {
        let mut leases = self.leases.lock();
        Self::prune(&mut leases);

        Ok(leases
            .iter()
            .map(|(campaign_id, lease)| ActiveLock {
                campaign_id: campaign_id.clone(),
                owner: lease.owner.clone(),
                ttl_remaining: Some(lease.expires_at.saturating_duration_since(Instant::now())),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn acquire_is_exclusive() {
        let lock = MemoryExecutionLock::new();
        let ttl = Duration::from_secs(60);

        assert!(lock.acquire("c1", "w1", ttl).await.unwrap().is_acquired());
        let second = lock.acquire("c1", "w2", ttl).await.unwrap();
        match second {
            AcquireOutcome::AlreadyHeld { existing } => assert_eq!(existing.owner_id, "w1"),
            AcquireOutcome::Acquired => panic!("second acquire must not win"),
        }

        // Different campaign is independent.
        assert!(lock.acquire("c2", "w2", ttl).await.unwrap().is_acquired());
    }

    #[tokio::test]
    async fn release_is_owner_verified() {
        let lock = MemoryExecutionLock::new();
        let ttl = Duration::from_secs(60);
        lock.acquire("c1", "w1", ttl).await.unwrap();

        assert!(matches!(
            lock.release("c1", "intruder", false).await.unwrap(),
            ReleaseOutcome::OwnerMismatch { .. }
        ));
        // Force overrides ownership.
        assert!(matches!(
            lock.release("c1", "intruder", true).await.unwrap(),
            ReleaseOutcome::Released
        ));
        assert!(matches!(
            lock.release("c1", "w1", false).await.unwrap(),
            ReleaseOutcome::NotHeld
        ));
    }

    #[tokio::test]
    async fn extend_requires_matching_owner() {
        let lock = MemoryExecutionLock::new();
        lock.acquire("c1", "w1", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(lock.extend("c1", "w1", Duration::from_secs(120)).await.unwrap());
        assert!(!lock.extend("c1", "w2", Duration::from_secs(120)).await.unwrap());
        assert!(!lock.extend("nope", "w1", Duration::from_secs(120)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_reacquired() {
        let lock = MemoryExecutionLock::new();
        lock.acquire("c1", "w1", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(lock
            .acquire("c1", "w2", Duration::from_secs(60))
            .await
            .unwrap()
            .is_acquired());
    }

    #[tokio::test]
    async fn concurrent_acquire_has_exactly_one_winner() {
        let lock = Arc::new(MemoryExecutionLock::new());
        let mut handles = Vec::new();
        for i in 0..100 {
            let lock = lock.clone();
            handles.push(tokio::spawn(async move {
                lock.acquire("c1", &format!("w{i}"), Duration::from_secs(60))
                    .await
                    .unwrap()
                    .is_acquired()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
