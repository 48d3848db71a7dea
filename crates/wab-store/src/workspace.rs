//! Workspace (Tenant) Entity
//!
//! A workspace is the unit of tenancy: it owns contacts, templates,
//! campaigns and conversations, and carries the BSP messaging credentials
//! under which outbound traffic is emitted.

use async_trait::async_trait;
use bson::serde_helpers::chrono_datetime_as_bson_datetime;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use wab_common::{MessagingTier, PlanTier, QualityRating};

/// Connection state of the tenant's WhatsApp phone number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhoneStatus {
    Connected,
    Disconnected,
}

impl Default for PhoneStatus {
    fn default() -> Self {
        PhoneStatus::Disconnected
    }
}

/// BSP messaging credentials supplied by the onboarding subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BspCredentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional"
    )]
    pub token_expires_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_account_id: Option<String>,
}

/// Rolled-up send counters per usage window. The authoritative throttle
/// counters live in the key-value store; these feed plan-quota preflight.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageCounters {
    pub sent_today: u64,
    pub sent_this_month: u64,
    /// Day key in `YYYY-MM-DD`; counters reset when the key rolls over.
    #[serde(default)]
    pub day_key: String,
    /// Month key in `YYYY-MM`.
    #[serde(default)]
    pub month_key: String,
}

/// Per-tenant overrides of the plan's daily/monthly caps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanLimitOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_messages: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_messages: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    #[serde(rename = "_id")]
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub plan: PlanTier,

    #[serde(default)]
    pub credentials: BspCredentials,

    #[serde(default)]
    pub quality_rating: QualityRating,

    #[serde(default)]
    pub messaging_tier: MessagingTier,

    #[serde(default)]
    pub phone_status: PhoneStatus,

    #[serde(default = "default_true")]
    pub active: bool,

    #[serde(default)]
    pub blocked: bool,

    #[serde(default)]
    pub capability_blocked: bool,

    #[serde(default)]
    pub usage: UsageCounters,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_overrides: Option<PlanLimitOverrides>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl Workspace {
    pub fn new(id: impl Into<String>, name: impl Into<String>, plan: PlanTier) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            plan,
            credentials: BspCredentials::default(),
            quality_rating: QualityRating::Unknown,
            messaging_tier: MessagingTier::default(),
            phone_status: PhoneStatus::Disconnected,
            active: true,
            blocked: false,
            capability_blocked: false,
            usage: UsageCounters::default(),
            limit_overrides: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn token_expired(&self, now: DateTime<Utc>) -> bool {
        match self.credentials.token_expires_at {
            Some(expiry) => expiry <= now,
            None => self.credentials.access_token.is_none(),
        }
    }

    pub fn token_expires_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        matches!(self.credentials.token_expires_at, Some(expiry) if expiry > now && expiry <= now + window)
    }

    /// A tenant is BSP-connected iff it has a non-expired token, a phone
    /// number id, and no blocked flag. Only connected tenants may be the
    /// source of outbound messages.
    pub fn is_bsp_connected(&self, now: DateTime<Utc>) -> bool {
        self.credentials.access_token.is_some()
            && !self.token_expired(now)
            && self.credentials.phone_number_id.is_some()
            && !self.blocked
    }

    pub fn effective_daily_cap(&self) -> Option<u64> {
        self.limit_overrides
            .as_ref()
            .and_then(|o| o.daily_messages)
            .or_else(|| self.plan.daily_message_cap())
    }

    pub fn effective_monthly_cap(&self) -> Option<u64> {
        self.limit_overrides
            .as_ref()
            .and_then(|o| o.monthly_messages)
            .or_else(|| self.plan.monthly_message_cap())
    }

    /// Remaining daily quota, `None` meaning unlimited.
    pub fn remaining_daily_quota(&self, now: DateTime<Utc>) -> Option<u64> {
        let sent = if self.usage.day_key == day_key(now) {
            self.usage.sent_today
        } else {
            0
        };
        self.effective_daily_cap().map(|cap| cap.saturating_sub(sent))
    }

    /// Remaining monthly quota, `None` meaning unlimited.
    pub fn remaining_monthly_quota(&self, now: DateTime<Utc>) -> Option<u64> {
        let sent = if self.usage.month_key == month_key(now) {
            self.usage.sent_this_month
        } else {
            0
        };
        self.effective_monthly_cap()
            .map(|cap| cap.saturating_sub(sent))
    }
}

/// Combined safety verdict for start/resume gating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyStatus {
    pub safe: bool,
    pub reason: Option<String>,
}

impl Workspace {
    /// Combine quality rating, account flags, phone state and token expiry
    /// into one gate. Start and resume both consult this.
    pub fn safety_status(&self, now: DateTime<Utc>) -> SafetyStatus {
        let unsafe_reason = if !self.active {
            Some("workspace is disabled".to_string())
        } else if self.blocked {
            Some("account is blocked".to_string())
        } else if self.capability_blocked {
            Some("messaging capability is revoked".to_string())
        } else if self.token_expired(now) {
            Some("access token is expired".to_string())
        } else if self.credentials.phone_number_id.is_none() {
            Some("no phone number is configured".to_string())
        } else if self.phone_status == PhoneStatus::Disconnected {
            Some("phone number is disconnected".to_string())
        } else if self.quality_rating == QualityRating::Red {
            Some("quality rating is RED".to_string())
        } else {
            None
        };

        SafetyStatus {
            safe: unsafe_reason.is_none(),
            reason: unsafe_reason,
        }
    }
}

pub fn day_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

pub fn month_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

#[async_trait]
pub trait WorkspaceRepository: Send + Sync {
    async fn insert(&self, workspace: &Workspace) -> Result<()>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Workspace>>;

    /// Lookup by the provider phone-number id carried on inbound webhooks.
    async fn find_by_phone_number_id(&self, phone_number_id: &str) -> Result<Option<Workspace>>;

    /// Lookup by WABA id, used by template-status webhooks which carry the
    /// business account rather than a phone number.
    async fn find_by_business_account_id(&self, waba_id: &str) -> Result<Option<Workspace>>;

    async fn update(&self, workspace: &Workspace) -> Result<()>;

    async fn set_quality_rating(&self, id: &str, rating: QualityRating) -> Result<bool>;

    async fn set_messaging_tier(&self, id: &str, tier: MessagingTier) -> Result<bool>;

    async fn set_phone_status(&self, id: &str, status: PhoneStatus) -> Result<bool>;

    async fn set_blocked(&self, id: &str, blocked: bool) -> Result<bool>;

    /// Roll send counts into the current day/month windows; stale window
    /// keys reset the corresponding counter before incrementing.
    async fn increment_usage(&self, id: &str, count: u64, at: DateTime<Utc>) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_workspace() -> Workspace {
        let mut ws = Workspace::new("t1", "Acme", PlanTier::Basic);
        ws.credentials.access_token = Some("token".into());
        ws.credentials.token_expires_at = Some(Utc::now() + Duration::days(30));
        ws.credentials.phone_number_id = Some("phone-1".into());
        ws
    }

    #[test]
    fn bsp_connection_requires_token_phone_and_no_block() {
        let now = Utc::now();
        let ws = connected_workspace();
        assert!(ws.is_bsp_connected(now));

        let mut blocked = connected_workspace();
        blocked.blocked = true;
        assert!(!blocked.is_bsp_connected(now));

        let mut expired = connected_workspace();
        expired.credentials.token_expires_at = Some(now - Duration::hours(1));
        assert!(!expired.is_bsp_connected(now));

        let mut no_phone = connected_workspace();
        no_phone.credentials.phone_number_id = None;
        assert!(!no_phone.is_bsp_connected(now));
    }

    #[test]
    fn token_expiry_window() {
        let now = Utc::now();
        let mut ws = connected_workspace();
        ws.credentials.token_expires_at = Some(now + Duration::hours(12));
        assert!(ws.token_expires_within(now, Duration::hours(24)));
        assert!(!ws.token_expired(now));
    }

    #[test]
    fn safety_gate_names_the_failure() {
        let now = Utc::now();
        let mut ws = connected_workspace();
        ws.phone_status = PhoneStatus::Connected;
        ws.quality_rating = QualityRating::Green;
        assert!(ws.safety_status(now).safe);

        ws.quality_rating = QualityRating::Red;
        let status = ws.safety_status(now);
        assert!(!status.safe);
        assert!(status.reason.unwrap().contains("RED"));

        let mut blocked = connected_workspace();
        blocked.phone_status = PhoneStatus::Connected;
        blocked.blocked = true;
        assert!(!blocked.safety_status(now).safe);

        // Yellow degrades but does not gate.
        let mut yellow = connected_workspace();
        yellow.phone_status = PhoneStatus::Connected;
        yellow.quality_rating = QualityRating::Yellow;
        assert!(yellow.safety_status(now).safe);
    }

    #[test]
    fn quota_resets_on_stale_window_key() {
        let now = Utc::now();
        let mut ws = connected_workspace();
        ws.usage.sent_today = 9_999;
        ws.usage.day_key = "1999-01-01".into();
        // Stale key means today's usage is effectively zero.
        assert_eq!(ws.remaining_daily_quota(now), Some(10_000));

        ws.usage.day_key = day_key(now);
        assert_eq!(ws.remaining_daily_quota(now), Some(1));
    }
}
