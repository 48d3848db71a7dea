//! BSP Multi-Tenant Router
//!
//! Resolves the `phone_number_id` carried on inbound webhooks to the owning
//! tenant. A short-TTL cache fronts the datastore for both hits and misses;
//! administrative operations invalidate the affected id. The outbound path
//! refuses tenants whose phone is unassigned or DISCONNECTED.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use wab_engine::{EngineError, MessagingProvider, Platform, Result};
use wab_provider::PhoneCredentials;
use wab_store::{PhoneStatus, Workspace, WorkspaceRepository};

const CACHE_TTL: Duration = Duration::from_secs(60);

enum CacheSlot {
    Hit(String),
    Miss,
}

struct CacheEntry {
    slot: CacheSlot,
    inserted_at: Instant,
}

pub struct TenantRouter {
    platform: Platform,
    cache: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl TenantRouter {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            cache: DashMap::new(),
            ttl: CACHE_TTL,
        }
    }

    /// Tenant id owning the phone-number id, if any. Negative results are
    /// cached too so unknown ids do not hammer the datastore.
    pub async fn resolve(&self, phone_number_id: &str) -> Result<Option<String>> {
        if let Some(entry) = self.cache.get(phone_number_id) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Ok(match &entry.slot {
                    CacheSlot::Hit(tenant_id) => Some(tenant_id.clone()),
                    CacheSlot::Miss => None,
                });
            }
        }

        let workspace = self
            .platform
            .store
            .workspaces
            .find_by_phone_number_id(phone_number_id)
            .await?;
        let slot = match &workspace {
            Some(workspace) => CacheSlot::Hit(workspace.id.clone()),
            None => CacheSlot::Miss,
        };
        self.cache.insert(
            phone_number_id.to_string(),
            CacheEntry {
                slot,
                inserted_at: Instant::now(),
            },
        );

        Ok(workspace.map(|w| w.id))
    }

    pub fn invalidate(&self, phone_number_id: &str) {
        self.cache.remove(phone_number_id);
    }

    /// Bind a phone-number id to a tenant and mark the phone connected.
    pub async fn assign_phone(&self, tenant_id: &str, phone_number_id: &str) -> Result<()> {
        let mut workspace = self.load(tenant_id).await?;
        if let Some(previous) = workspace.credentials.phone_number_id.take() {
            self.invalidate(&previous);
        }
        workspace.credentials.phone_number_id = Some(phone_number_id.to_string());
        workspace.phone_status = PhoneStatus::Connected;
        workspace.updated_at = chrono::Utc::now();
        self.platform.store.workspaces.update(&workspace).await?;
        self.invalidate(phone_number_id);
        info!(tenant_id = %tenant_id, phone_number_id = %phone_number_id, "Phone assigned");
        Ok(())
    }

    pub async fn unassign_phone(&self, tenant_id: &str) -> Result<()> {
        let mut workspace = self.load(tenant_id).await?;
        if let Some(previous) = workspace.credentials.phone_number_id.take() {
            self.invalidate(&previous);
        }
        workspace.phone_status = PhoneStatus::Disconnected;
        workspace.updated_at = chrono::Utc::now();
        self.platform.store.workspaces.update(&workspace).await?;
        info!(tenant_id = %tenant_id, "Phone unassigned");
        Ok(())
    }

    /// Pull quality/verification state from the provider and refresh the
    /// workspace.
    pub async fn sync_status(&self, tenant_id: &str) -> Result<()> {
        let workspace = self.load(tenant_id).await?;
        let (Some(access_token), Some(phone_number_id)) = (
            workspace.credentials.access_token.clone(),
            workspace.credentials.phone_number_id.clone(),
        ) else {
            return Err(EngineError::PhoneNotConfigured(tenant_id.to_string()));
        };

        let info = self
            .platform
            .provider
            .fetch_phone_number(&PhoneCredentials {
                access_token,
                phone_number_id: phone_number_id.clone(),
            })
            .await?;

        let rating = wab_common::QualityRating::from_provider(&info.quality_rating);
        self.platform
            .store
            .workspaces
            .set_quality_rating(tenant_id, rating)
            .await?;
        self.invalidate(&phone_number_id);
        debug!(tenant_id = %tenant_id, quality = ?rating, "Tenant status synced");
        Ok(())
    }

    /// Gate for outbound send paths: the tenant's phone must be assigned
    /// and connected.
    pub async fn ensure_outbound_allowed(&self, tenant_id: &str) -> Result<()> {
        let workspace = self.load(tenant_id).await?;
        if workspace.credentials.phone_number_id.is_none() {
            return Err(EngineError::PhoneNotConfigured(tenant_id.to_string()));
        }
        if workspace.phone_status == PhoneStatus::Disconnected {
            return Err(EngineError::WorkspaceUnsafe(
                "phone number is disconnected".to_string(),
            ));
        }
        Ok(())
    }

    async fn load(&self, tenant_id: &str) -> Result<Workspace> {
        self.platform
            .store
            .workspaces
            .find_by_id(tenant_id)
            .await?
            .ok_or_else(|| EngineError::WorkspaceNotFound(tenant_id.to_string()))
    }
}
