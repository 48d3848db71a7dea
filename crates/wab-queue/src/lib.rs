//! Campaign Job Queue
//!
//! A single logical queue with delayed delivery, at-least-once semantics and
//! unique job keys so duplicate enqueues coalesce. Backends: an embedded
//! SQLite queue for single-node deployments and an in-memory queue for
//! tests.
//!
//! The consumer distinguishes `nack` (a failure, counts toward the attempt
//! budget and eventually dead-letters) from `defer` (backpressure such as a
//! rate-limit wait; never counts as a failure).

use async_trait::async_trait;
use wab_common::CampaignJob;

pub mod error;
pub mod memory;
pub mod sqlite;

pub use error::QueueError;
pub use memory::MemoryJobQueue;
pub use sqlite::SqliteJobQueue;

pub type Result<T> = std::result::Result<T, QueueError>;

/// A job leased from the queue with tracking metadata.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub job: CampaignJob,
    pub receipt_handle: String,
    /// 1-based delivery count including this lease.
    pub attempt: u32,
}

/// Queue depth counters for the progress/health surfaces.
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    /// Visible and waiting for a worker.
    pub pending: u64,
    /// Leased to a worker right now.
    pub in_flight: u64,
    /// Published with a delay that has not elapsed.
    pub delayed: u64,
    /// Parked after exhausting their attempt budget.
    pub dead: u64,
}

#[async_trait]
pub trait JobConsumer: Send + Sync {
    /// Lease up to `max_jobs` visible jobs.
    async fn poll(&self, max_jobs: u32) -> Result<Vec<LeasedJob>>;

    /// Job done; delete it.
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Job failed; make it visible again after `delay`, or park it in the
    /// dead-letter bucket once the attempt budget is spent.
    async fn nack(
        &self,
        receipt_handle: &str,
        delay_seconds: u32,
        error: Option<String>,
    ) -> Result<()>;

    /// Backpressure; make the job visible again after `delay` without
    /// consuming an attempt.
    async fn defer(&self, receipt_handle: &str, delay_seconds: u32) -> Result<()>;

    /// Keep a long-running lease alive.
    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()>;

    async fn metrics(&self) -> Result<QueueMetrics>;
}

#[async_trait]
pub trait JobPublisher: Send + Sync {
    /// Publish immediately. Returns the job key; a duplicate key coalesces
    /// into the existing pending job.
    async fn publish(&self, job: CampaignJob) -> Result<String>;

    /// Publish with delayed visibility (staggered batches, scheduled
    /// starts).
    async fn publish_delayed(&self, job: CampaignJob, delay_seconds: u32) -> Result<String>;

    /// Drop every pending/delayed job of a campaign. In-flight jobs finish;
    /// their handlers observe the campaign state and stand down.
    async fn remove_pending(&self, campaign_id: &str) -> Result<u64>;

    /// Purge dead-letter rows older than the retention window.
    async fn purge_expired(&self) -> Result<u64>;
}

/// Both halves, as wired into the engine.
pub trait JobQueue: JobConsumer + JobPublisher {}
impl<T: JobConsumer + JobPublisher> JobQueue for T {}

/// Prefix of every job key belonging to a campaign; `remove_pending`
/// matches on it.
pub fn campaign_key_prefix(campaign_id: &str) -> String {
    format!("campaign:{campaign_id}:")
}
