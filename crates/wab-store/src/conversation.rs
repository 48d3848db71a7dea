//! Conversation Entity
//!
//! One open thread per (tenant, contact). `last_customer_message_at` is the
//! authoritative anchor for the 24-hour session window; inbound ingestion is
//! its only writer and updates are monotonic. The session check is always
//! `now - anchor < 24h` against the stored anchor, never a countdown timer.

use async_trait::async_trait;
use bson::serde_helpers::chrono_datetime_as_bson_datetime;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const SESSION_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    Open,
    Closed,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationNote {
    pub text: String,
    pub author: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(rename = "_id")]
    pub id: String,

    pub tenant_id: String,

    pub contact_id: String,

    pub status: ConversationStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    #[serde(default)]
    pub unread_count: u32,

    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional"
    )]
    pub last_customer_message_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub notes: Vec<ConversationNote>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(tenant_id: impl Into<String>, contact_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            contact_id: contact_id.into(),
            status: ConversationStatus::Open,
            assignee: None,
            unread_count: 0,
            last_customer_message_at: None,
            tags: Vec::new(),
            notes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a free-form (session) message may be sent right now.
    pub fn within_session_window(&self, now: DateTime<Utc>) -> bool {
        match self.last_customer_message_at {
            Some(anchor) => now - anchor < Duration::hours(SESSION_WINDOW_HOURS),
            None => false,
        }
    }
}

/// Which side opened the billing session; written to the ledger, consumed
/// only by the (external) analytics rollups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionOrigin {
    BusinessInitiated,
    UserInitiated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationLedgerEntry {
    #[serde(rename = "_id")]
    pub id: String,

    pub tenant_id: String,

    pub conversation_id: String,

    pub contact_id: String,

    pub origin: SessionOrigin,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,

    pub billable: bool,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub started_at: DateTime<Utc>,
}

impl ConversationLedgerEntry {
    pub fn business_initiated(
        conversation: &Conversation,
        campaign_id: Option<String>,
        template_id: Option<String>,
        billable: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: conversation.tenant_id.clone(),
            conversation_id: conversation.id.clone(),
            contact_id: conversation.contact_id.clone(),
            origin: SessionOrigin::BusinessInitiated,
            campaign_id,
            template_id,
            billable,
            started_at: Utc::now(),
        }
    }

    pub fn user_initiated(conversation: &Conversation) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: conversation.tenant_id.clone(),
            conversation_id: conversation.id.clone(),
            contact_id: conversation.contact_id.clone(),
            origin: SessionOrigin::UserInitiated,
            campaign_id: None,
            template_id: None,
            billable: true,
            started_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Find the open conversation for (tenant, contact), creating one lazily
    /// on first inbound.
    async fn ensure_open(&self, tenant_id: &str, contact_id: &str) -> Result<Conversation>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Conversation>>;

    async fn find_for_contact(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Option<Conversation>>;

    /// Monotonic anchor update: only moves `last_customer_message_at`
    /// forward. The sole writer is inbound ingestion.
    async fn touch_customer_message(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;

    async fn increment_unread(&self, id: &str) -> Result<()>;

    async fn set_assignee(&self, id: &str, assignee: Option<String>) -> Result<bool>;

    async fn set_status(&self, id: &str, status: ConversationStatus) -> Result<bool>;

    async fn add_tag(&self, id: &str, tag: &str) -> Result<bool>;

    async fn remove_tag(&self, id: &str, tag: &str) -> Result<bool>;

    async fn add_note(&self, id: &str, note: ConversationNote) -> Result<bool>;

    /// Open-conversation counts per assignee, for least-busy assignment.
    async fn count_open_by_assignee(&self, tenant_id: &str, assignee: &str) -> Result<u64>;

    async fn insert_ledger_entry(&self, entry: &ConversationLedgerEntry) -> Result<()>;

    async fn delete_all_for_tenant(&self, tenant_id: &str) -> Result<u64>;
}
