//! Per-Campaign Backoff Tracker
//!
//! Remembers a backoff deadline per campaign, set when the provider rate
//! limits or a retryable burst of errors demands breathing room. The batch
//! worker consults it before every batch and re-defers the job by the
//! remaining wait.

use std::time::Duration;

use crate::Result;

#[async_trait::async_trait]
pub trait BackoffTracker: Send + Sync {
    /// Start (or push out) the campaign's backoff window.
    async fn set_backoff(&self, campaign_id: &str, wait: Duration) -> Result<()>;

    /// Remaining wait, if any. `None` means clear to proceed.
    async fn should_wait(&self, campaign_id: &str) -> Result<Option<Duration>>;

    async fn clear(&self, campaign_id: &str) -> Result<()>;
}

pub(crate) fn backoff_key(campaign_id: &str) -> String {
    format!("campaign:backoff:{campaign_id}")
}
