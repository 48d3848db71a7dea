//! Campaign Execution Service
//!
//! Central orchestrator for the campaign lifecycle: create → start → pause
//! → resume → complete, plus the observer-initiated system pause. Start and
//! resume are gated by the kill switch, the tenant safety gate, the
//! distributed execution lock and preflight; every transition is a
//! conditional store write with an audit entry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::preflight::PreflightValidator;
use crate::Platform;
use wab_common::CampaignJob;
use wab_limits::{BackoffTracker, KillSwitch};
use wab_lock::ExecutionLock;
use wab_queue::{JobConsumer, JobPublisher, QueueMetrics};
use wab_store::{
    AuditAction, AuditEntry, BatchRepository, BatchStatus, Campaign, CampaignMessageRepository,
    CampaignRepository, CampaignStatus, CampaignTotals, CampaignTransition, PauseReason,
    RecipientSpec, TemplateRepository, TemplateSnapshot, TemplateStatus, WorkspaceRepository,
};

#[derive(Debug, Clone)]
pub struct CampaignSpec {
    pub name: String,
    pub template_id: String,
    pub recipients: RecipientSpec,
    pub variable_mapping: HashMap<String, String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub batch_size: Option<u32>,
}

/// Outcome of a completion-check pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Completed,
    PausedForFailureRate,
    InProgress,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignProgress {
    pub campaign_id: String,
    pub status: CampaignStatus,
    pub paused_reason: Option<PauseReason>,
    pub totals: CampaignTotals,
    pub delivery_rate: f64,
    pub read_rate: f64,
    pub failure_rate: f64,
    pub total_batches: u32,
    pub completed_batches: u32,
    pub failed_batches: u32,
    pub queue_pending: u64,
    pub queue_in_flight: u64,
    pub queue_delayed: u64,
    pub queue_dead: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub struct CampaignService {
    platform: Platform,
    preflight: PreflightValidator,
}

impl CampaignService {
    pub fn new(platform: Platform) -> Self {
        let preflight = PreflightValidator::new(platform.clone());
        Self { platform, preflight }
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    async fn load(&self, campaign_id: &str) -> Result<Campaign> {
        self.platform
            .store
            .campaigns
            .find_by_id(campaign_id)
            .await?
            .ok_or_else(|| EngineError::CampaignNotFound(campaign_id.to_string()))
    }

    async fn load_for_tenant(&self, tenant_id: &str, campaign_id: &str) -> Result<Campaign> {
        self.platform
            .store
            .campaigns
            .find_for_tenant(tenant_id, campaign_id)
            .await?
            .ok_or_else(|| EngineError::CampaignNotFound(campaign_id.to_string()))
    }

    async fn guard_kill_switch(&self) -> Result<()> {
        if let Some(reason) = self.platform.kill_switch.status().await? {
            return Err(EngineError::KillSwitchActive(reason));
        }
        Ok(())
    }

    async fn guard_tenant_safety(&self, tenant_id: &str) -> Result<()> {
        let workspace = self
            .platform
            .store
            .workspaces
            .find_by_id(tenant_id)
            .await?
            .ok_or_else(|| EngineError::WorkspaceNotFound(tenant_id.to_string()))?;
        let safety = workspace.safety_status(Utc::now());
        if !safety.safe {
            return Err(EngineError::WorkspaceUnsafe(
                safety.reason.unwrap_or_else(|| "unsafe".to_string()),
            ));
        }
        Ok(())
    }

    async fn release_lock(&self, campaign_id: &str) {
        // Lifecycle transitions always clear the lease; force covers the
        // case where a different node's worker held it.
        if let Err(e) = self
            .platform
            .lock
            .release(campaign_id, &self.platform.config.owner_id, true)
            .await
        {
            warn!(campaign_id = %campaign_id, error = %e, "Failed to release execution lock");
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    /// Create a campaign, snapshotting the template. DRAFT unless a
    /// schedule time is given, in which case SCHEDULED with a delayed
    /// scheduled-start job.
    pub async fn create(
        &self,
        tenant_id: &str,
        spec: CampaignSpec,
        actor: &str,
    ) -> Result<Campaign> {
        let template = self
            .platform
            .store
            .templates
            .find_by_id(tenant_id, &spec.template_id)
            .await?
            .ok_or_else(|| EngineError::TemplateNotFound(spec.template_id.clone()))?;
        if template.status != TemplateStatus::Approved {
            return Err(EngineError::TemplateNotApproved(template.name));
        }

        let snapshot = TemplateSnapshot {
            template_id: template.id.clone(),
            name: template.name.clone(),
            language: template.language.clone(),
            category: template.category,
            body_variable_count: template.body_variable_count(),
        };

        let mut campaign = Campaign::new(
            tenant_id,
            spec.name,
            snapshot,
            spec.recipients,
            spec.variable_mapping,
            spec.scheduled_at,
        );
        campaign.batching.batch_size = spec
            .batch_size
            .unwrap_or(self.platform.config.batch_size)
            .max(1);
        campaign.push_audit(AuditEntry::user(AuditAction::Created, actor, None));

        self.platform.store.campaigns.insert(&campaign).await?;

        if let Some(scheduled_at) = campaign.scheduled_at {
            let delay = (scheduled_at - Utc::now()).num_seconds().max(0) as u32;
            self.platform
                .queue
                .publish_delayed(
                    CampaignJob::scheduled_start(&campaign.id, tenant_id, scheduled_at),
                    delay,
                )
                .await?;
        }

        info!(
            campaign_id = %campaign.id,
            tenant_id = %tenant_id,
            scheduled = campaign.scheduled_at.is_some(),
            "Campaign created"
        );
        Ok(campaign)
    }

    /// Update name/recipients/mapping/schedule. Legal only before the
    /// campaign ever ran (DRAFT or SCHEDULED).
    pub async fn update(
        &self,
        campaign_id: &str,
        tenant_id: &str,
        spec: CampaignSpec,
    ) -> Result<Campaign> {
        let mut campaign = self.load_for_tenant(tenant_id, campaign_id).await?;
        if !campaign.can_update() {
            return Err(EngineError::InvalidStatus {
                expected: "DRAFT or SCHEDULED".to_string(),
                actual: format!("{:?}", campaign.status),
            });
        }

        campaign.name = spec.name;
        campaign.recipients = spec.recipients;
        campaign.variable_mapping = spec.variable_mapping;
        campaign.scheduled_at = spec.scheduled_at;
        if let Some(batch_size) = spec.batch_size {
            campaign.batching.batch_size = batch_size.max(1);
        }
        campaign.status = if campaign.scheduled_at.is_some() {
            CampaignStatus::Scheduled
        } else {
            CampaignStatus::Draft
        };
        campaign.updated_at = Utc::now();
        self.platform.store.campaigns.update(&campaign).await?;

        // Reschedule: a stale scheduled-start job stands down on its own
        // when the time no longer matches the campaign state.
        if let Some(scheduled_at) = campaign.scheduled_at {
            let delay = (scheduled_at - Utc::now()).num_seconds().max(0) as u32;
            self.platform
                .queue
                .publish_delayed(
                    CampaignJob::scheduled_start(&campaign.id, tenant_id, scheduled_at),
                    delay,
                )
                .await?;
        }
        Ok(campaign)
    }

    /// Start a campaign: kill switch → safety gate → execution lock →
    /// preflight → RUNNING + campaign-start job. Any failure after lock
    /// acquisition force-releases the lock.
    pub async fn start(&self, campaign_id: &str, tenant_id: &str, actor: &str) -> Result<()> {
        self.guard_kill_switch().await?;
        self.guard_tenant_safety(tenant_id).await?;

        let campaign = self.load_for_tenant(tenant_id, campaign_id).await?;
        if !campaign.can_start() {
            return Err(EngineError::InvalidStatus {
                expected: "DRAFT or SCHEDULED".to_string(),
                actual: format!("{:?}", campaign.status),
            });
        }

        let acquired = self
            .platform
            .lock
            .acquire(
                campaign_id,
                &self.platform.config.owner_id,
                self.platform.config.lock_ttl,
            )
            .await?;
        if let wab_lock::AcquireOutcome::AlreadyHeld { existing } = acquired {
            return Err(EngineError::CampaignAlreadyRunning {
                campaign_id: campaign_id.to_string(),
                owner: existing.owner_id,
            });
        }

        let result = self.start_locked(&campaign, tenant_id, actor).await;
        if result.is_err() {
            self.release_lock(campaign_id).await;
        }
        result
    }

    async fn start_locked(&self, campaign: &Campaign, tenant_id: &str, actor: &str) -> Result<()> {
        let report = self.preflight.validate(campaign).await?;
        if !report.valid {
            return Err(EngineError::PreflightFailed { report });
        }

        let moved = self
            .platform
            .store
            .campaigns
            .try_transition(
                &campaign.id,
                &[CampaignStatus::Draft, CampaignStatus::Scheduled],
                CampaignTransition::to(CampaignStatus::Running)
                    .with_started_at(Utc::now())
                    .with_audit(AuditEntry::user(AuditAction::Started, actor, None)),
            )
            .await?;
        if !moved {
            return Err(EngineError::InvalidStatus {
                expected: "DRAFT or SCHEDULED".to_string(),
                actual: "changed concurrently".to_string(),
            });
        }

        self.platform
            .queue
            .publish(CampaignJob::start(&campaign.id, tenant_id))
            .await?;

        info!(campaign_id = %campaign.id, actor = %actor, "Campaign started");
        Ok(())
    }

    /// User-initiated pause. Legal only from RUNNING.
    pub async fn pause(
        &self,
        campaign_id: &str,
        tenant_id: &str,
        actor: &str,
        reason: Option<String>,
    ) -> Result<()> {
        let campaign = self.load_for_tenant(tenant_id, campaign_id).await?;
        if !campaign.can_pause() {
            return Err(EngineError::InvalidStatus {
                expected: "RUNNING".to_string(),
                actual: format!("{:?}", campaign.status),
            });
        }

        self.pause_inner(
            campaign_id,
            PauseReason::UserPaused,
            AuditEntry::user(AuditAction::Paused, actor, reason),
        )
        .await?;
        info!(campaign_id = %campaign_id, actor = %actor, "Campaign paused");
        Ok(())
    }

    /// Observer-initiated pause (webhooks, failure policy). Idempotent: a
    /// campaign no longer RUNNING is left untouched.
    pub async fn system_pause(&self, campaign_id: &str, reason: PauseReason) -> Result<bool> {
        let campaign = match self.platform.store.campaigns.find_by_id(campaign_id).await? {
            Some(campaign) if campaign.can_pause() => campaign,
            _ => return Ok(false),
        };

        self.pause_inner(
            &campaign.id,
            reason,
            AuditEntry::system(AuditAction::SystemPaused, format!("{reason:?}")),
        )
        .await?;

        metrics::counter!("wab_system_pauses_total").increment(1);
        warn!(campaign_id = %campaign_id, reason = ?reason, "Campaign system-paused");
        Ok(true)
    }

    async fn pause_inner(
        &self,
        campaign_id: &str,
        reason: PauseReason,
        audit: AuditEntry,
    ) -> Result<()> {
        // Drop queued work first so no new batch job fires, then park the
        // non-final batches. In-flight sends complete and their webhook
        // completions are still accepted.
        self.platform.queue.remove_pending(campaign_id).await?;
        self.platform.store.batches.pause_nonfinal(campaign_id).await?;

        let moved = self
            .platform
            .store
            .campaigns
            .try_transition(
                campaign_id,
                &[CampaignStatus::Running],
                CampaignTransition::to(CampaignStatus::Paused)
                    .with_pause_reason(reason)
                    .with_audit(audit),
            )
            .await?;
        if !moved {
            return Err(EngineError::InvalidStatus {
                expected: "RUNNING".to_string(),
                actual: "changed concurrently".to_string(),
            });
        }

        self.release_lock(campaign_id).await;
        Ok(())
    }

    /// Resume from PAUSED. Re-checks the kill switch, safety gate and the
    /// resume preflight subset; re-enqueues only resumable batches.
    /// COMPLETED and PROCESSING batches are never re-enqueued.
    pub async fn resume(&self, campaign_id: &str, tenant_id: &str, actor: &str) -> Result<()> {
        self.guard_kill_switch().await?;
        self.guard_tenant_safety(tenant_id).await?;

        let campaign = self.load_for_tenant(tenant_id, campaign_id).await?;
        if !campaign.can_resume() {
            return Err(EngineError::InvalidStatus {
                expected: "PAUSED".to_string(),
                actual: format!("{:?}", campaign.status),
            });
        }

        let acquired = self
            .platform
            .lock
            .acquire(
                campaign_id,
                &self.platform.config.owner_id,
                self.platform.config.lock_ttl,
            )
            .await?;
        if let wab_lock::AcquireOutcome::AlreadyHeld { existing } = acquired {
            return Err(EngineError::CampaignAlreadyRunning {
                campaign_id: campaign_id.to_string(),
                owner: existing.owner_id,
            });
        }

        let result = self.resume_locked(&campaign, tenant_id, actor).await;
        if result.is_err() {
            self.release_lock(campaign_id).await;
        }
        result
    }

    async fn resume_locked(&self, campaign: &Campaign, tenant_id: &str, actor: &str) -> Result<()> {
        let report = self.preflight.validate_resume(campaign).await?;
        if !report.valid {
            return Err(EngineError::PreflightFailed { report });
        }

        let resumable = self
            .platform
            .store
            .batches
            .find_resumable(&campaign.id)
            .await?;

        if resumable.is_empty() {
            let queued = self
                .platform
                .store
                .campaign_messages
                .count_queued(&campaign.id)
                .await?;
            if queued == 0 {
                // Nothing left to do: the pause landed after the last send.
                self.complete(&campaign.id, "resumed with no remaining work")
                    .await?;
                return Ok(());
            }
        }

        for batch in &resumable {
            self.platform
                .store
                .batches
                .try_transition(
                    &batch.id,
                    &[BatchStatus::Failed, BatchStatus::Paused],
                    BatchStatus::Pending,
                )
                .await?;
        }

        let moved = self
            .platform
            .store
            .campaigns
            .try_transition(
                &campaign.id,
                &[CampaignStatus::Paused],
                CampaignTransition::to(CampaignStatus::Running)
                    .clear_pause_reason()
                    .with_audit(AuditEntry::user(AuditAction::Resumed, actor, None)),
            )
            .await?;
        if !moved {
            return Err(EngineError::InvalidStatus {
                expected: "PAUSED".to_string(),
                actual: "changed concurrently".to_string(),
            });
        }

        let stagger = self.platform.config.batch_stagger.as_secs() as u32;
        for (position, batch) in resumable.iter().enumerate() {
            self.platform
                .queue
                .publish_delayed(
                    CampaignJob::batch(&campaign.id, tenant_id, &batch.id, batch.index),
                    stagger * position as u32,
                )
                .await?;
        }
        self.platform
            .queue
            .publish_delayed(
                CampaignJob::check(&campaign.id, tenant_id),
                stagger * resumable.len() as u32 + 30,
            )
            .await?;

        info!(
            campaign_id = %campaign.id,
            resumed_batches = resumable.len(),
            actor = %actor,
            "Campaign resumed"
        );
        Ok(())
    }

    /// Terminal success; called by the worker when every batch is final.
    pub async fn complete(&self, campaign_id: &str, reason: &str) -> Result<bool> {
        let moved = self
            .platform
            .store
            .campaigns
            .try_transition(
                campaign_id,
                &[CampaignStatus::Running, CampaignStatus::Paused],
                CampaignTransition::to(CampaignStatus::Completed)
                    .clear_pause_reason()
                    .with_completed_at(Utc::now())
                    .with_audit(AuditEntry::system(AuditAction::Completed, reason)),
            )
            .await?;

        if moved {
            self.release_lock(campaign_id).await;
            self.platform.backoff.clear(campaign_id).await?;
            info!(campaign_id = %campaign_id, "Campaign completed");
        }
        Ok(moved)
    }

    /// Terminal failure; completion time is set.
    pub async fn fail(&self, campaign_id: &str, reason: &str) -> Result<bool> {
        let moved = self
            .platform
            .store
            .campaigns
            .try_transition(
                campaign_id,
                &[
                    CampaignStatus::Draft,
                    CampaignStatus::Scheduled,
                    CampaignStatus::Running,
                    CampaignStatus::Paused,
                ],
                CampaignTransition::to(CampaignStatus::Failed)
                    .with_completed_at(Utc::now())
                    .with_audit(AuditEntry::system(AuditAction::Failed, reason)),
            )
            .await?;

        if moved {
            self.release_lock(campaign_id).await;
            warn!(campaign_id = %campaign_id, reason = %reason, "Campaign failed");
        }
        Ok(moved)
    }

    /// Delete is forbidden while RUNNING.
    pub async fn delete(&self, campaign_id: &str, tenant_id: &str) -> Result<()> {
        let campaign = self.load_for_tenant(tenant_id, campaign_id).await?;
        if !campaign.can_delete() {
            return Err(EngineError::InvalidStatus {
                expected: "not RUNNING".to_string(),
                actual: format!("{:?}", campaign.status),
            });
        }
        self.platform.queue.remove_pending(campaign_id).await?;
        self.platform
            .store
            .batches
            .delete_all_for_campaign(campaign_id)
            .await?;
        self.platform
            .store
            .campaign_messages
            .delete_all_for_campaign(campaign_id)
            .await?;
        self.platform.store.campaigns.delete(campaign_id).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Completion check
    // ------------------------------------------------------------------

    /// All batches final: sync authoritative totals from the batch
    /// aggregates and complete. Also evaluates the failure policy and
    /// system-pauses on breach.
    pub async fn completion_check(&self, campaign_id: &str) -> Result<CheckOutcome> {
        let campaign = self.load(campaign_id).await?;
        if campaign.status.is_terminal() {
            return Ok(CheckOutcome::Completed);
        }

        let counts = self
            .platform
            .store
            .batches
            .counts_by_status(campaign_id)
            .await?;

        let (sent, failed) = self
            .platform
            .store
            .batches
            .recipient_outcome_counts(campaign_id)
            .await?;

        if campaign.status == CampaignStatus::Running
            && self
                .platform
                .config
                .failure_policy
                .rate_exceeded(sent, failed)
        {
            self.system_pause(campaign_id, PauseReason::HighFailureRate)
                .await?;
            return Ok(CheckOutcome::PausedForFailureRate);
        }

        if counts.total() > 0 && counts.completed + counts.failed >= counts.total() {
            let queued = campaign
                .totals
                .total_recipients
                .saturating_sub(sent + failed);
            self.platform
                .store
                .campaigns
                .set_outcome_totals(campaign_id, sent, failed, queued)
                .await?;
            self.complete(campaign_id, "all batches final").await?;
            return Ok(CheckOutcome::Completed);
        }

        Ok(CheckOutcome::InProgress)
    }

    // ------------------------------------------------------------------
    // Progress surface
    // ------------------------------------------------------------------

    pub async fn progress(&self, campaign_id: &str, tenant_id: &str) -> Result<CampaignProgress> {
        let campaign = self.load_for_tenant(tenant_id, campaign_id).await?;
        let counts = self
            .platform
            .store
            .batches
            .counts_by_status(campaign_id)
            .await?;
        let queue: QueueMetrics = self.platform.queue.metrics().await?;

        let totals = campaign.totals;
        let delivery_rate = if totals.sent > 0 {
            totals.delivered as f64 / totals.sent as f64
        } else {
            0.0
        };
        let read_rate = if totals.delivered > 0 {
            totals.read as f64 / totals.delivered as f64
        } else {
            0.0
        };

        Ok(CampaignProgress {
            campaign_id: campaign.id,
            status: campaign.status,
            paused_reason: campaign.paused_reason,
            totals,
            delivery_rate,
            read_rate,
            failure_rate: totals.failure_rate(),
            total_batches: counts.total().max(campaign.batching.total_batches),
            completed_batches: counts.completed,
            failed_batches: counts.failed,
            queue_pending: queue.pending,
            queue_in_flight: queue.in_flight,
            queue_delayed: queue.delayed,
            queue_dead: queue.dead,
            started_at: campaign.started_at,
            paused_at: campaign.paused_at,
            completed_at: campaign.completed_at,
        })
    }
}
