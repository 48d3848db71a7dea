//! In-memory job queue for tests and development.
//!
//! Same visibility/dead-letter semantics as the SQLite backend without the
//! database.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::{campaign_key_prefix, LeasedJob, QueueError, QueueMetrics, Result};
use wab_common::CampaignJob;

#[derive(Clone)]
struct StoredJob {
    job: CampaignJob,
    visible_at: Instant,
    receipt_handle: Option<String>,
    receive_count: u32,
    dead: bool,
    last_error: Option<String>,
    sequence: u64,
}

pub struct MemoryJobQueue {
    jobs: Mutex<HashMap<String, StoredJob>>,
    visibility_timeout: Duration,
    max_attempts: u32,
    sequence: Mutex<u64>,
}

impl MemoryJobQueue {
    pub fn new(visibility_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            visibility_timeout,
            max_attempts,
            sequence: Mutex::new(0),
        }
    }

    fn insert(&self, job: CampaignJob, delay: Duration) -> String {
        let key = job.job_key();
        let mut jobs = self.jobs.lock();
        if let Some(existing) = jobs.get(&key) {
            if !existing.dead {
                return key;
            }
        }
        let mut sequence = self.sequence.lock();
        *sequence += 1;
        jobs.insert(
            key.clone(),
            StoredJob {
                job,
                visible_at: Instant::now() + delay,
                receipt_handle: None,
                receive_count: 0,
                dead: false,
                last_error: None,
                sequence: *sequence,
            },
        );
        key
    }

    /// Last recorded error of a dead job, for assertions.
    pub fn dead_job_error(&self, job_key: &str) -> Option<String> {
        self.jobs
            .lock()
            .get(job_key)
            .filter(|j| j.dead)
            .and_then(|j| j.last_error.clone())
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), 3)
    }
}

#[async_trait]
impl crate::JobConsumer for MemoryJobQueue {
    async fn poll(&self, max_jobs: u32) -> Result<Vec<LeasedJob>> {
        let mut jobs = self.jobs.lock();
        let now = Instant::now();

        let mut eligible: Vec<&mut StoredJob> = jobs
            .values_mut()
            .filter(|j| !j.dead && j.visible_at <= now)
            .collect();
        eligible.sort_by_key(|j| j.sequence);

        let mut leased = Vec::new();
        for stored in eligible.into_iter().take(max_jobs as usize) {
            let receipt = uuid::Uuid::new_v4().to_string();
            stored.receipt_handle = Some(receipt.clone());
            stored.visible_at = now + self.visibility_timeout;
            stored.receive_count += 1;
            leased.push(LeasedJob {
                job: stored.job.clone(),
                receipt_handle: receipt,
                attempt: stored.receive_count,
            });
        }
        Ok(leased)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let key = jobs
            .iter()
            .find(|(_, j)| j.receipt_handle.as_deref() == Some(receipt_handle))
            .map(|(k, _)| k.clone())
            .ok_or_else(|| QueueError::NotFound(receipt_handle.to_string()))?;
        jobs.remove(&key);
        Ok(())
    }

    async fn nack(
        &self,
        receipt_handle: &str,
        delay_seconds: u32,
        error: Option<String>,
    ) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let stored = jobs
            .values_mut()
            .find(|j| j.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| QueueError::NotFound(receipt_handle.to_string()))?;

        stored.receipt_handle = None;
        if error.is_some() {
            stored.last_error = error;
        }
        if stored.receive_count >= self.max_attempts {
            stored.dead = true;
        } else {
            stored.visible_at = Instant::now() + Duration::from_secs(delay_seconds as u64);
        }
        Ok(())
    }

    async fn defer(&self, receipt_handle: &str, delay_seconds: u32) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let stored = jobs
            .values_mut()
            .find(|j| j.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| QueueError::NotFound(receipt_handle.to_string()))?;

        stored.receipt_handle = None;
        stored.receive_count = stored.receive_count.saturating_sub(1);
        stored.visible_at = Instant::now() + Duration::from_secs(delay_seconds as u64);
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let stored = jobs
            .values_mut()
            .find(|j| j.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| QueueError::NotFound(receipt_handle.to_string()))?;
        stored.visible_at = Instant::now() + Duration::from_secs(seconds as u64);
        Ok(())
    }

    async fn metrics(&self) -> Result<QueueMetrics> {
        let jobs = self.jobs.lock();
        let now = Instant::now();
        let mut metrics = QueueMetrics::default();
        for job in jobs.values() {
            if job.dead {
                metrics.dead += 1;
            } else if job.receipt_handle.is_some() {
                metrics.in_flight += 1;
            } else if job.visible_at <= now {
                metrics.pending += 1;
            } else {
                metrics.delayed += 1;
            }
        }
        Ok(metrics)
    }
}

#[async_trait]
impl crate::JobPublisher for MemoryJobQueue {
    async fn publish(&self, job: CampaignJob) -> Result<String> {
        Ok(self.insert(job, Duration::ZERO))
    }

    async fn publish_delayed(&self, job: CampaignJob, delay_seconds: u32) -> Result<String> {
        Ok(self.insert(job, Duration::from_secs(delay_seconds as u64)))
    }

    async fn remove_pending(&self, campaign_id: &str) -> Result<u64> {
        let prefix = campaign_key_prefix(campaign_id);
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|key, job| {
            !(key.starts_with(&prefix) && job.receipt_handle.is_none() && !job.dead)
        });
        Ok((before - jobs.len()) as u64)
    }

    async fn purge_expired(&self) -> Result<u64> {
        // Dead jobs in memory live until the process exits; nothing ages out.
        Ok(0)
    }
}
