//! Campaign Scheduler
//!
//! Periodic tick (one minute) that:
//! - promotes SCHEDULED campaigns whose time has arrived by enqueueing a
//!   scheduled-start job (duplicate keys coalesce, so repeated ticks are
//!   harmless)
//! - requeues batch jobs for PROCESSING batches abandoned past the stale
//!   threshold (crash recovery)
//! - purges dead-letter jobs past their retention window

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::Platform;
use wab_common::CampaignJob;
use wab_queue::JobPublisher;
use wab_store::{BatchRepository, CampaignRepository};

pub struct CampaignScheduler {
    platform: Platform,
    tick_interval: Duration,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl CampaignScheduler {
    pub fn new(platform: Platform) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            platform,
            tick_interval: Duration::from_secs(60),
            running: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already running");
            return;
        }

        info!(
            tick_seconds = self.tick_interval.as_secs(),
            "Starting campaign scheduler"
        );

        let scheduler = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = interval(scheduler.tick_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        scheduler.tick().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Campaign scheduler shutting down");
                        break;
                    }
                }
            }
        });
    }

    pub async fn tick(&self) {
        if let Err(e) = self.promote_due_campaigns().await {
            error!(error = %e, "Scheduled campaign promotion failed");
        }
        if let Err(e) = self.recover_stale_batches().await {
            error!(error = %e, "Stale batch recovery failed");
        }
        if let Err(e) = self.platform.queue.purge_expired().await {
            error!(error = %e, "Dead-letter purge failed");
        }
    }

    async fn promote_due_campaigns(&self) -> crate::Result<()> {
        let due = self
            .platform
            .store
            .campaigns
            .find_due_scheduled(Utc::now())
            .await?;
        for campaign in due {
            debug!(campaign_id = %campaign.id, "Promoting scheduled campaign");
            self.platform
                .queue
                .publish(CampaignJob::scheduled_start(
                    &campaign.id,
                    &campaign.tenant_id,
                    campaign.scheduled_at.unwrap_or_else(Utc::now),
                ))
                .await?;
        }
        Ok(())
    }

    async fn recover_stale_batches(&self) -> crate::Result<()> {
        let stale_after = ChronoDuration::from_std(self.platform.config.stale_processing_after)
            .unwrap_or_else(|_| ChronoDuration::minutes(10));
        let cutoff = Utc::now() - stale_after;

        let stale = self.platform.store.batches.find_stale_processing(cutoff).await?;
        for batch in stale {
            warn!(
                batch_id = %batch.id,
                campaign_id = %batch.campaign_id,
                "Requeueing stale PROCESSING batch"
            );
            self.platform
                .queue
                .publish(CampaignJob::batch(
                    &batch.campaign_id,
                    &batch.tenant_id,
                    &batch.id,
                    batch.index,
                ))
                .await?;
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}
