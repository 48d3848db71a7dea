//! Webhook Log Entity
//!
//! Append-only record of every provider callback with its processing
//! outcome, kept for replay and forensics.

use async_trait::async_trait;
use bson::serde_helpers::chrono_datetime_as_bson_datetime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookOutcome {
    Received,
    Processed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookLog {
    #[serde(rename = "_id")]
    pub id: String,

    /// Resolved tenant, absent when the phone-number id was unknown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Coarse event type (`status`, `message`, `template_status`, ...).
    pub event_type: String,

    /// Raw payload as received.
    pub payload: serde_json::Value,

    pub outcome: WebhookOutcome,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub received_at: DateTime<Utc>,
}

impl WebhookLog {
    pub fn received(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: None,
            event_type: event_type.into(),
            payload,
            outcome: WebhookOutcome::Received,
            error: None,
            received_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait WebhookLogRepository: Send + Sync {
    async fn insert(&self, log: &WebhookLog) -> Result<()>;

    async fn set_outcome(
        &self,
        id: &str,
        tenant_id: Option<String>,
        outcome: WebhookOutcome,
        error: Option<String>,
    ) -> Result<()>;

    async fn find_by_id(&self, id: &str) -> Result<Option<WebhookLog>>;
}
