//! Campaign Batch Entity
//!
//! A batch is a bounded slice of a campaign's recipients processed by one
//! worker invocation. Batch finality invariant: once COMPLETED a batch never
//! transitions back and never re-emits messages; repositories enforce this
//! with conditional status updates.

use async_trait::async_trait;
use bson::serde_helpers::chrono_datetime_as_bson_datetime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
    Paused,
}

impl BatchStatus {
    /// COMPLETED is the only status a batch can never leave.
    pub fn is_final(&self) -> bool {
        matches!(self, BatchStatus::Completed)
    }

    /// Statuses a resume may re-enqueue. PROCESSING is deliberately absent:
    /// an in-flight batch must finish or go stale before it runs again.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            BatchStatus::Pending | BatchStatus::Failed | BatchStatus::Paused
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecipientStatus {
    Pending,
    Queued,
    Sent,
    Failed,
    Skipped,
}

impl RecipientStatus {
    pub fn needs_send(&self) -> bool {
        matches!(self, RecipientStatus::Pending | RecipientStatus::Queued)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecipient {
    pub contact_id: String,
    pub phone: String,
    pub status: RecipientStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional"
    )]
    pub processed_at: Option<DateTime<Utc>>,
}

impl BatchRecipient {
    pub fn new(contact_id: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            contact_id: contact_id.into(),
            phone: phone.into(),
            status: RecipientStatus::Pending,
            provider_message_id: None,
            error: None,
            processed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignBatch {
    #[serde(rename = "_id")]
    pub id: String,

    pub campaign_id: String,

    pub tenant_id: String,

    /// 0-based position within the campaign's batching plan.
    pub index: u32,

    pub status: BatchStatus,

    pub recipients: Vec<BatchRecipient>,

    #[serde(default)]
    pub attempts: u32,

    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional"
    )]
    pub processing_started_at: Option<DateTime<Utc>>,

    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional"
    )]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl CampaignBatch {
    pub fn new(
        campaign_id: impl Into<String>,
        tenant_id: impl Into<String>,
        index: u32,
        recipients: Vec<BatchRecipient>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            campaign_id: campaign_id.into(),
            tenant_id: tenant_id.into(),
            index,
            status: BatchStatus::Pending,
            recipients,
            attempts: 0,
            processing_started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn pending_recipients(&self) -> impl Iterator<Item = &BatchRecipient> {
        self.recipients.iter().filter(|r| r.status.needs_send())
    }

    pub fn has_pending_recipients(&self) -> bool {
        self.recipients.iter().any(|r| r.status.needs_send())
    }

    /// A PROCESSING batch older than the threshold is treated as abandoned
    /// by a crashed worker and may be retried.
    pub fn is_stale_processing(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        self.status == BatchStatus::Processing
            && matches!(self.processing_started_at, Some(at) if now - at >= threshold)
    }
}

/// Per-recipient outcome applied by the batch worker.
#[derive(Debug, Clone)]
pub struct RecipientUpdate {
    pub status: RecipientStatus,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub processed_at: DateTime<Utc>,
}

impl RecipientUpdate {
    pub fn sent(provider_message_id: impl Into<String>) -> Self {
        Self {
            status: RecipientStatus::Sent,
            provider_message_id: Some(provider_message_id.into()),
            error: None,
            processed_at: Utc::now(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RecipientStatus::Failed,
            provider_message_id: None,
            error: Some(error.into()),
            processed_at: Utc::now(),
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: RecipientStatus::Skipped,
            provider_message_id: None,
            error: None,
            processed_at: Utc::now(),
        }
    }
}

/// Counts of a campaign's batches grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStatusCounts {
    pub pending: u32,
    pub queued: u32,
    pub processing: u32,
    pub completed: u32,
    pub failed: u32,
    pub paused: u32,
}

impl BatchStatusCounts {
    pub fn total(&self) -> u32 {
        self.pending + self.queued + self.processing + self.completed + self.failed + self.paused
    }

    pub fn all_final(&self) -> bool {
        self.total() > 0 && self.pending + self.queued + self.processing + self.paused == 0
    }
}

#[async_trait]
pub trait BatchRepository: Send + Sync {
    async fn insert_many(&self, batches: &[CampaignBatch]) -> Result<()>;

    async fn find_by_id(&self, id: &str) -> Result<Option<CampaignBatch>>;

    async fn find_by_campaign(&self, campaign_id: &str) -> Result<Vec<CampaignBatch>>;

    /// Conditionally move `id` from any of `from` to `to`. Never succeeds
    /// out of COMPLETED regardless of the `from` set.
    async fn try_transition(
        &self,
        id: &str,
        from: &[BatchStatus],
        to: BatchStatus,
    ) -> Result<bool>;

    /// PENDING/QUEUED/FAILED → PROCESSING with started timestamp + attempt
    /// bump; returns false when the batch is already final or in flight.
    async fn mark_processing(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Re-claim a PROCESSING batch abandoned by a crashed worker: succeeds
    /// only when the started timestamp is older than `cutoff`, refreshing it
    /// to `at` and bumping the attempt count.
    async fn reclaim_stale_processing(
        &self,
        id: &str,
        cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// PROCESSING → COMPLETED, recording the completion time. Idempotent:
    /// false when the batch was not PROCESSING.
    async fn mark_completed(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Update one recipient's slot inside the batch document.
    async fn update_recipient(
        &self,
        batch_id: &str,
        contact_id: &str,
        update: RecipientUpdate,
    ) -> Result<bool>;

    /// Move all non-final, non-processing batches of a campaign to PAUSED.
    /// Returns the number of batches transitioned.
    async fn pause_nonfinal(&self, campaign_id: &str) -> Result<u64>;

    /// Batches a resume may re-enqueue (PENDING / FAILED / PAUSED).
    /// COMPLETED and PROCESSING batches are never returned.
    async fn find_resumable(&self, campaign_id: &str) -> Result<Vec<CampaignBatch>>;

    async fn counts_by_status(&self, campaign_id: &str) -> Result<BatchStatusCounts>;

    /// Aggregate sent/failed recipient counts across all batches; the
    /// completion check syncs these into the campaign totals.
    async fn recipient_outcome_counts(&self, campaign_id: &str) -> Result<(u64, u64)>;

    /// PROCESSING batches whose started timestamp is older than the cutoff.
    async fn find_stale_processing(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CampaignBatch>>;

    async fn delete_all_for_campaign(&self, campaign_id: &str) -> Result<u64>;
}
