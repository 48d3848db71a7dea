use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod logging;

// ============================================================================
// Campaign Jobs
// ============================================================================

/// A unit of campaign work that flows through the job queue.
///
/// Jobs are uniquely keyed so that duplicate enqueues coalesce at the queue
/// layer (e.g. re-enqueueing batch 3 of a campaign is a no-op while the first
/// enqueue is still pending).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignJob {
    pub kind: JobKind,
    pub campaign_id: String,
    pub tenant_id: String,
    /// Batch index for `BatchProcess` jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<u32>,
    /// Scheduled fire time for `ScheduledStart` jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    /// Resolve recipients, create batches, enqueue batch jobs.
    CampaignStart,
    /// Send one batch of recipients.
    BatchProcess,
    /// Detect completion or failure thresholds.
    CampaignCheck,
    /// Promote a scheduled campaign when its time arrives.
    ScheduledStart,
}

impl CampaignJob {
    pub fn start(campaign_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            kind: JobKind::CampaignStart,
            campaign_id: campaign_id.into(),
            tenant_id: tenant_id.into(),
            batch_id: None,
            batch_index: None,
            scheduled_at: None,
        }
    }

    pub fn batch(
        campaign_id: impl Into<String>,
        tenant_id: impl Into<String>,
        batch_id: impl Into<String>,
        batch_index: u32,
    ) -> Self {
        Self {
            kind: JobKind::BatchProcess,
            campaign_id: campaign_id.into(),
            tenant_id: tenant_id.into(),
            batch_id: Some(batch_id.into()),
            batch_index: Some(batch_index),
            scheduled_at: None,
        }
    }

    pub fn check(campaign_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            kind: JobKind::CampaignCheck,
            campaign_id: campaign_id.into(),
            tenant_id: tenant_id.into(),
            batch_id: None,
            batch_index: None,
            scheduled_at: None,
        }
    }

    pub fn scheduled_start(
        campaign_id: impl Into<String>,
        tenant_id: impl Into<String>,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: JobKind::ScheduledStart,
            campaign_id: campaign_id.into(),
            tenant_id: tenant_id.into(),
            batch_id: None,
            batch_index: None,
            scheduled_at: Some(scheduled_at),
        }
    }

    /// Deduplication key; duplicate enqueues of the same key coalesce.
    pub fn job_key(&self) -> String {
        match self.kind {
            JobKind::CampaignStart => format!("campaign:{}:start", self.campaign_id),
            JobKind::BatchProcess => format!(
                "campaign:{}:batch:{}",
                self.campaign_id,
                self.batch_index.unwrap_or(0)
            ),
            JobKind::CampaignCheck => format!("campaign:{}:check", self.campaign_id),
            JobKind::ScheduledStart => format!("campaign:{}:scheduled", self.campaign_id),
        }
    }
}

/// Outcome of a job handler invocation, acted on by the queue runtime.
///
/// Handlers never reach into the queue themselves; backoff is expressed as a
/// first-class value rather than a thrown control-flow error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Job finished; ack and delete.
    Completed,
    /// Job must run again after the given delay; defer without counting a
    /// failure (rate limit or backoff window).
    RetryAfter(Duration),
    /// Job failed; nack for retry under the attempt policy.
    Failed(String),
}

/// Retry policy applied by the queue runtime to failed jobs.
#[derive(Debug, Clone)]
pub struct JobRetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for JobRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(300),
        }
    }
}

impl JobRetryPolicy {
    /// Exponential backoff for the given (1-based) attempt, without jitter.
    /// The runtime adds jitter on top.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(8);
        let delay = self.backoff_base.saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.backoff_cap)
    }
}

// ============================================================================
// Tenant plan / tier / quality
// ============================================================================

/// Subscription plan, caps daily and monthly outbound volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanTier {
    Free,
    Basic,
    Premium,
    Enterprise,
}

impl PlanTier {
    pub fn daily_message_cap(&self) -> Option<u64> {
        match self {
            PlanTier::Free => Some(1_000),
            PlanTier::Basic => Some(10_000),
            PlanTier::Premium => Some(100_000),
            PlanTier::Enterprise => None,
        }
    }

    pub fn monthly_message_cap(&self) -> Option<u64> {
        self.daily_message_cap().map(|d| d * 30)
    }
}

impl Default for PlanTier {
    fn default() -> Self {
        PlanTier::Free
    }
}

/// Provider-assigned messaging tier: distinct recipients per rolling 24h.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagingTier {
    Tier50,
    Tier250,
    #[serde(rename = "TIER_1K")]
    Tier1k,
    #[serde(rename = "TIER_10K")]
    Tier10k,
    #[serde(rename = "TIER_100K")]
    Tier100k,
    TierUnlimited,
}

impl MessagingTier {
    /// Parse the provider's tier vocabulary (`TIER_1K`, `TIER_UNLIMITED`).
    pub fn from_provider(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TIER_50" => Some(MessagingTier::Tier50),
            "TIER_250" => Some(MessagingTier::Tier250),
            "TIER_1K" | "TIER_1000" => Some(MessagingTier::Tier1k),
            "TIER_10K" | "TIER_10000" => Some(MessagingTier::Tier10k),
            "TIER_100K" | "TIER_100000" => Some(MessagingTier::Tier100k),
            "TIER_UNLIMITED" => Some(MessagingTier::TierUnlimited),
            _ => None,
        }
    }

    pub fn daily_recipient_cap(&self) -> Option<u64> {
        match self {
            MessagingTier::Tier50 => Some(50),
            MessagingTier::Tier250 => Some(250),
            MessagingTier::Tier1k => Some(1_000),
            MessagingTier::Tier10k => Some(10_000),
            MessagingTier::Tier100k => Some(100_000),
            MessagingTier::TierUnlimited => None,
        }
    }
}

impl Default for MessagingTier {
    fn default() -> Self {
        MessagingTier::Tier1k
    }
}

/// Provider-assigned phone quality rating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityRating {
    Green,
    Yellow,
    Red,
    Unknown,
}

impl Default for QualityRating {
    fn default() -> Self {
        QualityRating::Unknown
    }
}

impl QualityRating {
    /// Parse the provider's webhook vocabulary (`GREEN`/`YELLOW`/`RED`).
    pub fn from_provider(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "GREEN" => QualityRating::Green,
            "YELLOW" => QualityRating::Yellow,
            "RED" => QualityRating::Red,
            _ => QualityRating::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_keys_coalesce_per_batch() {
        let a = CampaignJob::batch("c1", "t1", "b3", 3);
        let b = CampaignJob::batch("c1", "t1", "b3", 3);
        assert_eq!(a.job_key(), b.job_key());
        assert_eq!(a.job_key(), "campaign:c1:batch:3");

        let other = CampaignJob::batch("c1", "t1", "b4", 4);
        assert_ne!(a.job_key(), other.job_key());
    }

    #[test]
    fn retry_backoff_is_exponential_and_capped() {
        let policy = JobRetryPolicy::default();
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_secs(10));
        assert_eq!(policy.backoff_for_attempt(3), Duration::from_secs(20));
        assert_eq!(policy.backoff_for_attempt(12), Duration::from_secs(300));
    }

    #[test]
    fn tier_caps() {
        assert_eq!(MessagingTier::Tier1k.daily_recipient_cap(), Some(1_000));
        assert_eq!(MessagingTier::TierUnlimited.daily_recipient_cap(), None);
        assert_eq!(PlanTier::Basic.daily_message_cap(), Some(10_000));
    }

    #[test]
    fn quality_parses_provider_vocabulary() {
        assert_eq!(QualityRating::from_provider("green"), QualityRating::Green);
        assert_eq!(QualityRating::from_provider("RED"), QualityRating::Red);
        assert_eq!(QualityRating::from_provider("??"), QualityRating::Unknown);
    }
}
