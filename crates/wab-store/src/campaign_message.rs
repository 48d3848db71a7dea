//! Campaign Message Entity
//!
//! Join record per (campaign, contact). Its status mirrors the unified
//! message lifecycle and is the idempotency anchor for batch replays: a
//! campaign message already in SENT/DELIVERED/READ means the recipient was
//! charged and must never be re-emitted.

use async_trait::async_trait;
use bson::serde_helpers::chrono_datetime_as_bson_datetime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::{AdvanceOutcome, MessageStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignMessage {
    #[serde(rename = "_id")]
    pub id: String,

    pub campaign_id: String,

    pub contact_id: String,

    pub tenant_id: String,

    pub status: MessageStatus,

    #[serde(default)]
    pub attempt_count: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,

    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional"
    )]
    pub sent_at: Option<DateTime<Utc>>,

    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional"
    )]
    pub delivered_at: Option<DateTime<Utc>>,

    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional"
    )]
    pub read_at: Option<DateTime<Utc>>,

    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional"
    )]
    pub failed_at: Option<DateTime<Utc>>,

    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional"
    )]
    pub replied_at: Option<DateTime<Utc>>,
}

impl CampaignMessage {
    pub fn new(
        campaign_id: impl Into<String>,
        contact_id: impl Into<String>,
        tenant_id: impl Into<String>,
        status: MessageStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            campaign_id: campaign_id.into(),
            contact_id: contact_id.into(),
            tenant_id: tenant_id.into(),
            status,
            attempt_count: 0,
            provider_message_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            failed_at: None,
            replied_at: None,
        }
    }

    /// Whether a replay may emit a new provider send for this recipient.
    /// SENT and beyond means the provider was already charged.
    pub fn already_emitted(&self) -> bool {
        matches!(
            self.status,
            MessageStatus::Sent | MessageStatus::Delivered | MessageStatus::Read
        )
    }
}

#[async_trait]
pub trait CampaignMessageRepository: Send + Sync {
    /// Create-or-update the join record keyed by (campaign, contact). A
    /// successful emission upserts SENT with the provider id; a send failure
    /// upserts FAILED with the error and bumps the attempt count.
    async fn upsert_send_outcome(
        &self,
        campaign_id: &str,
        contact_id: &str,
        tenant_id: &str,
        status: MessageStatus,
        provider_message_id: Option<String>,
        error: Option<String>,
    ) -> Result<CampaignMessage>;

    async fn find(&self, campaign_id: &str, contact_id: &str)
        -> Result<Option<CampaignMessage>>;

    /// Monotonic status advance from webhook rollups, guarded on the
    /// expected current status like the unified message apply.
    async fn apply_advance(
        &self,
        id: &str,
        expected_current: MessageStatus,
        outcome: &AdvanceOutcome,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Record a customer reply against the campaign message.
    async fn mark_replied(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Campaign messages still waiting to be sent (QUEUED/SENDING).
    async fn count_queued(&self, campaign_id: &str) -> Result<u64>;

    /// The most recent campaign message for a contact across campaigns,
    /// used to attribute inbound replies.
    async fn find_latest_for_contact(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Option<CampaignMessage>>;

    async fn delete_all_for_campaign(&self, campaign_id: &str) -> Result<u64>;
}
