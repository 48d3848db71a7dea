//! Campaign Entity
//!
//! A campaign snapshots its template at creation time and tracks the full
//! fan-out lifecycle: totals rolled up atomically from workers and webhooks,
//! batching progress, failure state, and a bounded audit trail.

use async_trait::async_trait;
use bson::serde_helpers::chrono_datetime_as_bson_datetime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::contact::RecipientSpec;
use crate::error::Result;
use crate::template::TemplateCategory;

pub const AUDIT_TRAIL_CAP: usize = 100;
pub const DEFAULT_BATCH_SIZE: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
    Failed,
}

impl CampaignStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Failed)
    }
}

/// Why a campaign is paused; always machine-readable on a PAUSED campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PauseReason {
    UserPaused,
    LimitReached,
    TemplateRevoked,
    AccountBlocked,
    AccountDisabled,
    TokenExpired,
    CapabilityRevoked,
    HighFailureRate,
    RateLimited,
    PhoneDisconnected,
    QualityDegraded,
    TierDowngraded,
    KillSwitchActivated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Created,
    Started,
    Paused,
    SystemPaused,
    Resumed,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub action: AuditAction,
    /// Principal id, or `system` for observer-initiated transitions.
    pub actor: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub system_initiated: bool,
}

impl AuditEntry {
    pub fn user(action: AuditAction, actor: impl Into<String>, reason: Option<String>) -> Self {
        Self {
            action,
            actor: actor.into(),
            at: Utc::now(),
            reason,
            system_initiated: false,
        }
    }

    pub fn system(action: AuditAction, reason: impl Into<String>) -> Self {
        Self {
            action,
            actor: "system".to_string(),
            at: Utc::now(),
            reason: Some(reason.into()),
            system_initiated: true,
        }
    }
}

/// Template fields frozen into the campaign at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSnapshot {
    pub template_id: String,
    pub name: String,
    pub language: String,
    pub category: TemplateCategory,
    pub body_variable_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignTotals {
    pub total_recipients: u64,
    pub queued: u64,
    pub sent: u64,
    pub delivered: u64,
    pub read: u64,
    pub failed: u64,
    pub replied: u64,
}

impl CampaignTotals {
    pub fn processed(&self) -> u64 {
        self.sent + self.failed
    }

    pub fn failure_rate(&self) -> f64 {
        let processed = self.processed();
        if processed == 0 {
            0.0
        } else {
            self.failed as f64 / processed as f64
        }
    }
}

/// Atomic `$inc` delta against the totals struct.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TotalsDelta {
    pub queued: i64,
    pub sent: i64,
    pub delivered: i64,
    pub read: i64,
    pub failed: i64,
    pub replied: i64,
}

impl TotalsDelta {
    pub fn sent(n: i64) -> Self {
        Self {
            sent: n,
            ..Default::default()
        }
    }

    pub fn failed(n: i64) -> Self {
        Self {
            failed: n,
            ..Default::default()
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchingPlan {
    pub batch_size: u32,
    pub total_batches: u32,
    pub completed_batches: u32,
    pub failed_batches: u32,
}

impl Default for BatchingPlan {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            total_batches: 0,
            completed_batches: 0,
            failed_batches: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureTracking {
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Most recent provider error codes, newest last, bounded by the writer.
    #[serde(default)]
    pub last_error_codes: Vec<i64>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional"
    )]
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    #[serde(rename = "_id")]
    pub id: String,

    pub tenant_id: String,

    pub name: String,

    pub template: TemplateSnapshot,

    pub recipients: RecipientSpec,

    /// templateVar position (1-based, as string key for BSON) → contact
    /// field path.
    #[serde(default)]
    pub variable_mapping: HashMap<String, String>,

    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional"
    )]
    pub scheduled_at: Option<DateTime<Utc>>,

    pub status: CampaignStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_reason: Option<PauseReason>,

    #[serde(default)]
    pub totals: CampaignTotals,

    #[serde(default)]
    pub batching: BatchingPlan,

    #[serde(default)]
    pub failure: FailureTracking,

    #[serde(default)]
    pub audit: Vec<AuditEntry>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,

    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional"
    )]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional"
    )]
    pub paused_at: Option<DateTime<Utc>>,

    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional"
    )]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    pub fn new(
        tenant_id: impl Into<String>,
        name: impl Into<String>,
        template: TemplateSnapshot,
        recipients: RecipientSpec,
        variable_mapping: HashMap<String, String>,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        let status = if scheduled_at.is_some() {
            CampaignStatus::Scheduled
        } else {
            CampaignStatus::Draft
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            template,
            recipients,
            variable_mapping,
            scheduled_at,
            status,
            paused_reason: None,
            totals: CampaignTotals::default(),
            batching: BatchingPlan::default(),
            failure: FailureTracking::default(),
            audit: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            paused_at: None,
            completed_at: None,
        }
    }

    pub fn can_start(&self) -> bool {
        matches!(
            self.status,
            CampaignStatus::Draft | CampaignStatus::Scheduled
        )
    }

    pub fn can_pause(&self) -> bool {
        self.status == CampaignStatus::Running
    }

    pub fn can_resume(&self) -> bool {
        self.status == CampaignStatus::Paused
    }

    pub fn can_delete(&self) -> bool {
        self.status != CampaignStatus::Running
    }

    pub fn can_update(&self) -> bool {
        matches!(
            self.status,
            CampaignStatus::Draft | CampaignStatus::Scheduled
        )
    }

    /// Append an audit entry, keeping the trail bounded.
    pub fn push_audit(&mut self, entry: AuditEntry) {
        self.audit.push(entry);
        if self.audit.len() > AUDIT_TRAIL_CAP {
            let excess = self.audit.len() - AUDIT_TRAIL_CAP;
            self.audit.drain(..excess);
        }
    }

    pub fn all_batches_final(&self) -> bool {
        self.batching.total_batches > 0
            && self.batching.completed_batches + self.batching.failed_batches
                >= self.batching.total_batches
    }
}

/// Fields updated together when a campaign transitions state. Repositories
/// apply these as one conditional write so concurrent observers can never
/// see a half-applied transition.
#[derive(Debug, Clone, Default)]
pub struct CampaignTransition {
    pub to: Option<CampaignStatus>,
    pub paused_reason: Option<Option<PauseReason>>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub audit: Option<AuditEntry>,
}

impl CampaignTransition {
    pub fn to(status: CampaignStatus) -> Self {
        Self {
            to: Some(status),
            ..Default::default()
        }
    }

    pub fn with_pause_reason(mut self, reason: PauseReason) -> Self {
        self.paused_reason = Some(Some(reason));
        self.paused_at = Some(Utc::now());
        self
    }

    pub fn clear_pause_reason(mut self) -> Self {
        self.paused_reason = Some(None);
        self
    }

    pub fn with_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn with_completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn with_audit(mut self, entry: AuditEntry) -> Self {
        self.audit = Some(entry);
        self
    }
}

#[async_trait]
pub trait CampaignRepository: Send + Sync {
    async fn insert(&self, campaign: &Campaign) -> Result<()>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Campaign>>;

    async fn find_for_tenant(&self, tenant_id: &str, id: &str) -> Result<Option<Campaign>>;

    async fn update(&self, campaign: &Campaign) -> Result<()>;

    /// Conditionally transition status: applies only when the current status
    /// is in `from`. Returns false (without writing) otherwise. This is the
    /// sole way campaign status changes after creation.
    async fn try_transition(
        &self,
        id: &str,
        from: &[CampaignStatus],
        transition: CampaignTransition,
    ) -> Result<bool>;

    /// Atomic `$inc` on the totals counters.
    async fn increment_totals(&self, id: &str, delta: TotalsDelta) -> Result<()>;

    /// Sync authoritative sent/failed/queued totals from batch aggregates;
    /// the completion check is the only caller.
    async fn set_outcome_totals(&self, id: &str, sent: u64, failed: u64, queued: u64)
        -> Result<()>;

    /// Persist the batching plan computed by the start job.
    async fn set_batching_plan(
        &self,
        id: &str,
        total_recipients: u64,
        batch_size: u32,
        total_batches: u32,
    ) -> Result<()>;

    async fn increment_completed_batches(&self, id: &str) -> Result<()>;

    async fn increment_failed_batches(&self, id: &str) -> Result<()>;

    /// Record a send failure: bump the consecutive counter, remember the
    /// error and provider code (bounded list).
    async fn record_send_failure(
        &self,
        id: &str,
        error: &str,
        provider_code: Option<i64>,
    ) -> Result<()>;

    /// Any success clears the consecutive-failure counter.
    async fn clear_consecutive_failures(&self, id: &str) -> Result<()>;

    async fn push_audit(&self, id: &str, entry: AuditEntry) -> Result<()>;

    /// RUNNING campaigns referencing the given template snapshot.
    async fn list_running_by_template(&self, template_id: &str) -> Result<Vec<Campaign>>;

    async fn list_running_by_tenant(&self, tenant_id: &str) -> Result<Vec<Campaign>>;

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Campaign>>;

    /// SCHEDULED campaigns whose schedule time has arrived.
    async fn find_due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>>;

    async fn delete(&self, id: &str) -> Result<bool>;

    async fn delete_all_for_tenant(&self, tenant_id: &str) -> Result<u64>;
}
