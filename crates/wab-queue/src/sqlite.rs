//! SQLite-backed job queue
//!
//! Mimics SQS-style visibility semantics for single-node deployments:
//! `visible_at` gates delivery, leases hand out receipt handles, and a
//! `dead` state parks jobs that exhausted their attempt budget. Failed jobs
//! are retained seven days for forensics, then purged.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::{campaign_key_prefix, LeasedJob, QueueError, QueueMetrics, Result};
use wab_common::CampaignJob;

const DEAD_RETENTION_SECONDS: i64 = 7 * 24 * 60 * 60;

pub struct SqliteJobQueue {
    pool: Pool<Sqlite>,
    visibility_timeout_seconds: u32,
    max_attempts: u32,
    running: AtomicBool,
}

impl SqliteJobQueue {
    pub fn new(pool: Pool<Sqlite>, visibility_timeout_seconds: u32, max_attempts: u32) -> Self {
        Self {
            pool,
            visibility_timeout_seconds,
            max_attempts,
            running: AtomicBool::new(true),
        }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS campaign_jobs (
                job_key TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'ready',
                receipt_handle TEXT,
                visible_at INTEGER NOT NULL,
                receive_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                dead_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_visible
            ON campaign_jobs (state, visible_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Campaign job queue schema initialized");
        Ok(())
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn generate_receipt_handle(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    async fn insert_job(&self, job: CampaignJob, delay_seconds: u32) -> Result<String> {
        let key = job.job_key();
        let payload = serde_json::to_string(&job)?;
        let now = Utc::now().timestamp();

        // Unique job keys coalesce duplicate enqueues.
        let existing = sqlx::query(
            "SELECT state FROM campaign_jobs WHERE job_key = ?",
        )
        .bind(&key)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = existing {
            let state: String = row.get("state");
            if state == "ready" {
                debug!(job_key = %key, "Duplicate job enqueue coalesced");
                return Ok(key);
            }
            // A dead twin does not block re-enqueueing fresh work.
            sqlx::query("DELETE FROM campaign_jobs WHERE job_key = ?")
                .bind(&key)
                .execute(&self.pool)
                .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO campaign_jobs (job_key, payload, state, visible_at, created_at)
            VALUES (?, ?, 'ready', ?, ?)
            "#,
        )
        .bind(&key)
        .bind(&payload)
        .bind(now + delay_seconds as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(job_key = %key, delay_seconds = delay_seconds, "Job published");
        Ok(key)
    }
}

#[async_trait]
impl crate::JobConsumer for SqliteJobQueue {
    async fn poll(&self, max_jobs: u32) -> Result<Vec<LeasedJob>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let now = Utc::now().timestamp();
        let new_visible_at = now + self.visibility_timeout_seconds as i64;

        let rows = sqlx::query(
            r#"
            SELECT job_key, payload, receive_count
            FROM campaign_jobs
            WHERE state = 'ready' AND visible_at <= ?
            ORDER BY created_at
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(max_jobs as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get("job_key");
            let payload: String = row.get("payload");
            let receive_count: i64 = row.get("receive_count");

            let receipt_handle = self.generate_receipt_handle();
            let updated = sqlx::query(
                r#"
                UPDATE campaign_jobs
                SET receipt_handle = ?, visible_at = ?, receive_count = receive_count + 1
                WHERE job_key = ? AND state = 'ready' AND visible_at <= ?
                "#,
            )
            .bind(&receipt_handle)
            .bind(new_visible_at)
            .bind(&key)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if updated.rows_affected() == 0 {
                // Another worker leased it between SELECT and UPDATE.
                continue;
            }

            let job: CampaignJob = serde_json::from_str(&payload)?;
            jobs.push(LeasedJob {
                job,
                receipt_handle,
                attempt: receive_count as u32 + 1,
            });
        }

        Ok(jobs)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM campaign_jobs WHERE receipt_handle = ?")
            .bind(receipt_handle)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            warn!(receipt_handle = %receipt_handle, "ACK failed - job not found");
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        }
        Ok(())
    }

    async fn nack(
        &self,
        receipt_handle: &str,
        delay_seconds: u32,
        error: Option<String>,
    ) -> Result<()> {
        let now = Utc::now().timestamp();

        // Attempt budget spent -> dead-letter.
        let dead = sqlx::query(
            r#"
            UPDATE campaign_jobs
            SET state = 'dead', receipt_handle = NULL, dead_at = ?, last_error = COALESCE(?, last_error)
            WHERE receipt_handle = ? AND receive_count >= ?
            "#,
        )
        .bind(now)
        .bind(&error)
        .bind(receipt_handle)
        .bind(self.max_attempts as i64)
        .execute(&self.pool)
        .await?;

        if dead.rows_affected() > 0 {
            warn!(receipt_handle = %receipt_handle, "Job moved to dead-letter bucket");
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            UPDATE campaign_jobs
            SET visible_at = ?, receipt_handle = NULL, last_error = COALESCE(?, last_error)
            WHERE receipt_handle = ?
            "#,
        )
        .bind(now + delay_seconds as i64)
        .bind(&error)
        .bind(receipt_handle)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        }
        Ok(())
    }

    async fn defer(&self, receipt_handle: &str, delay_seconds: u32) -> Result<()> {
        let now = Utc::now().timestamp();
        // Deferral hands the attempt back: backpressure is not failure.
        let result = sqlx::query(
            r#"
            UPDATE campaign_jobs
            SET visible_at = ?, receipt_handle = NULL,
                receive_count = CASE WHEN receive_count > 0 THEN receive_count - 1 ELSE 0 END
            WHERE receipt_handle = ?
            "#,
        )
        .bind(now + delay_seconds as i64)
        .bind(receipt_handle)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        }
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        let result = sqlx::query(
            "UPDATE campaign_jobs SET visible_at = ? WHERE receipt_handle = ?",
        )
        .bind(Utc::now().timestamp() + seconds as i64)
        .bind(receipt_handle)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        }
        Ok(())
    }

    async fn metrics(&self) -> Result<QueueMetrics> {
        let now = Utc::now().timestamp();
        let row = sqlx::query(
            r#"
            SELECT
                SUM(CASE WHEN state = 'ready' AND receipt_handle IS NULL AND visible_at <= ? THEN 1 ELSE 0 END) AS pending,
                SUM(CASE WHEN state = 'ready' AND receipt_handle IS NOT NULL THEN 1 ELSE 0 END) AS in_flight,
                SUM(CASE WHEN state = 'ready' AND receipt_handle IS NULL AND visible_at > ? THEN 1 ELSE 0 END) AS delayed,
                SUM(CASE WHEN state = 'dead' THEN 1 ELSE 0 END) AS dead
            FROM campaign_jobs
            "#,
        )
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueMetrics {
            pending: row.get::<Option<i64>, _>("pending").unwrap_or(0) as u64,
            in_flight: row.get::<Option<i64>, _>("in_flight").unwrap_or(0) as u64,
            delayed: row.get::<Option<i64>, _>("delayed").unwrap_or(0) as u64,
            dead: row.get::<Option<i64>, _>("dead").unwrap_or(0) as u64,
        })
    }
}

#[async_trait]
impl crate::JobPublisher for SqliteJobQueue {
    async fn publish(&self, job: CampaignJob) -> Result<String> {
        self.insert_job(job, 0).await
    }

    async fn publish_delayed(&self, job: CampaignJob, delay_seconds: u32) -> Result<String> {
        self.insert_job(job, delay_seconds).await
    }

    async fn remove_pending(&self, campaign_id: &str) -> Result<u64> {
        let pattern = format!("{}%", campaign_key_prefix(campaign_id));
        // In-flight jobs (leased receipt) are left to finish; their handlers
        // observe the campaign status and stand down.
        let result = sqlx::query(
            r#"
            DELETE FROM campaign_jobs
            WHERE state = 'ready' AND receipt_handle IS NULL AND job_key LIKE ?
            "#,
        )
        .bind(&pattern)
        .execute(&self.pool)
        .await?;
        debug!(
            campaign_id = %campaign_id,
            removed = result.rows_affected(),
            "Removed pending campaign jobs"
        );
        Ok(result.rows_affected())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let cutoff = Utc::now().timestamp() - DEAD_RETENTION_SECONDS;
        let result = sqlx::query(
            "DELETE FROM campaign_jobs WHERE state = 'dead' AND dead_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
