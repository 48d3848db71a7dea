//! Unified Message Entity
//!
//! One record per message in either direction. Outbound messages carry the
//! provider message id (the idempotency key tying persistence to webhook
//! callbacks) and campaign attribution metadata.
//!
//! Status progression is monotonic: queued < sending < sent < delivered <
//! read, with FAILED as a terminal sink. `advance_plan` computes the exact
//! counter deltas for a transition so that rollups collapse skipped states
//! (read arriving before delivered counts both, once) and restatements are
//! no-ops.

use async_trait::async_trait;
use bson::serde_helpers::chrono_datetime_as_bson_datetime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::campaign::TotalsDelta;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Text,
    Template,
    Image,
    Video,
    Document,
    Audio,
}

impl MessageKind {
    /// Message kinds that may only be sent inside the 24-hour session
    /// window. Templates are exempt.
    pub fn requires_session_window(&self) -> bool {
        !matches!(self, MessageKind::Template)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Queued,
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
    /// Inbound-only resting state.
    Received,
}

impl MessageStatus {
    /// Position in the outbound progression; FAILED and RECEIVED sit outside
    /// the ordering.
    fn rank(&self) -> Option<u8> {
        match self {
            MessageStatus::Queued => Some(0),
            MessageStatus::Sending => Some(1),
            MessageStatus::Sent => Some(2),
            MessageStatus::Delivered => Some(3),
            MessageStatus::Read => Some(4),
            MessageStatus::Failed | MessageStatus::Received => None,
        }
    }

    pub fn from_provider_status(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

/// The effect of applying an incoming status to a message.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvanceOutcome {
    pub new_status: MessageStatus,
    /// Counter deltas to apply atomically to the owning campaign. Skipped
    /// states are collapsed in (+1 each, exactly once); a failure after
    /// progression moves the message out of the progression buckets so the
    /// conservation invariants hold at every instant.
    pub delta: TotalsDelta,
    /// Progression states newly reached by this transition, in order;
    /// drives the per-transition timestamp writes.
    pub reached: Vec<MessageStatus>,
}

/// Compute the monotonic advance from `current` on an incoming status.
/// Returns `None` when the webhook restates or regresses (silently dropped)
/// or the message is already in the FAILED sink.
pub fn advance_plan(current: MessageStatus, incoming: MessageStatus) -> Option<AdvanceOutcome> {
    if current == MessageStatus::Failed || incoming == MessageStatus::Received {
        return None;
    }

    if incoming == MessageStatus::Failed {
        let mut delta = TotalsDelta {
            failed: 1,
            ..Default::default()
        };
        // Back out progression counters this message already landed in.
        if let Some(rank) = current.rank() {
            if rank >= 2 {
                delta.sent -= 1;
            }
            if rank >= 3 {
                delta.delivered -= 1;
            }
            if rank >= 4 {
                delta.read -= 1;
            }
        }
        return Some(AdvanceOutcome {
            new_status: MessageStatus::Failed,
            delta,
            reached: vec![MessageStatus::Failed],
        });
    }

    let (cur, inc) = (current.rank()?, incoming.rank()?);
    if inc <= cur {
        return None;
    }

    let mut delta = TotalsDelta::default();
    let mut reached = Vec::new();
    if cur < 2 && 2 <= inc {
        delta.sent += 1;
        reached.push(MessageStatus::Sent);
    }
    if cur < 3 && 3 <= inc {
        delta.delivered += 1;
        reached.push(MessageStatus::Delivered);
    }
    if cur < 4 && 4 <= inc {
        delta.read += 1;
        reached.push(MessageStatus::Read);
    }

    Some(AdvanceOutcome {
        new_status: incoming,
        delta,
        reached,
    })
}

/// Campaign attribution carried on outbound campaign messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribution {
    pub campaign_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub template_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: String,

    pub tenant_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,

    pub direction: Direction,

    pub kind: MessageKind,

    pub status: MessageStatus,

    /// Recipient (outbound) or sender (inbound) phone, E.164 digits.
    pub phone: String,

    /// Text body or media caption; template messages store the rendered
    /// body preview.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribution: Option<Attribution>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,

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
}

impl Message {
    /// An outbound message persisted in one write after a successful
    /// provider emission.
    pub fn outbound_sent(
        tenant_id: impl Into<String>,
        contact_id: Option<String>,
        phone: impl Into<String>,
        kind: MessageKind,
        body: Option<String>,
        provider_message_id: impl Into<String>,
        attribution: Option<Attribution>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            contact_id,
            conversation_id: None,
            direction: Direction::Outbound,
            kind,
            status: MessageStatus::Sent,
            phone: phone.into(),
            body,
            media_url: None,
            provider_message_id: Some(provider_message_id.into()),
            attribution,
            last_error: None,
            created_at: now,
            sent_at: Some(now),
            delivered_at: None,
            read_at: None,
            failed_at: None,
        }
    }

    pub fn inbound_received(
        tenant_id: impl Into<String>,
        contact_id: impl Into<String>,
        conversation_id: impl Into<String>,
        phone: impl Into<String>,
        kind: MessageKind,
        body: Option<String>,
        provider_message_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            contact_id: Some(contact_id.into()),
            conversation_id: Some(conversation_id.into()),
            direction: Direction::Inbound,
            kind,
            status: MessageStatus::Received,
            phone: phone.into(),
            body,
            media_url: None,
            provider_message_id,
            attribution: None,
            last_error: None,
            created_at: now,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            failed_at: None,
        }
    }
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn insert(&self, message: &Message) -> Result<()>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Message>>;

    /// The webhook path's sole lookup: tolerant of unknown ids by design.
    async fn find_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<Message>>;

    /// Apply a computed advance: set the new status, stamp each newly
    /// reached state at `at`, and record the error if failing. Guarded by a
    /// current-status condition so concurrent webhook deliveries apply at
    /// most once; returns false when the guard missed.
    async fn apply_advance(
        &self,
        id: &str,
        expected_current: MessageStatus,
        outcome: &AdvanceOutcome,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<bool>;

    async fn list_for_campaign(&self, campaign_id: &str, limit: i64) -> Result<Vec<Message>>;

    async fn delete_all_for_tenant(&self, tenant_id: &str) -> Result<u64>;
}
