//! Campaign Worker Pool & Job Handlers
//!
//! Each job is handled as a pure function from {job, platform} to a
//! `JobOutcome`; the pool runtime acts on the outcome (ack / defer / nack).
//! Backoff is a first-class value, never control-flow via errors.
//!
//! Concurrency: a fixed set of polling workers bounded by the engine
//! config, with a global jobs/sec governor as an outer guardrail on top of
//! the per-tenant rate limiter.

use chrono::{Duration as ChronoDuration, Utc};
use governor::{Quota, RateLimiter as GovernorLimiter};
use nonzero_ext::nonzero;
use rand::Rng;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::sender::{SendRequest, TemplateRef, TemplateSender};
use crate::service::{CampaignService, CheckOutcome};
use crate::variables::build_body_variables;
use crate::Platform;
use wab_common::{CampaignJob, JobKind, JobOutcome, JobRetryPolicy};
use wab_limits::{BackoffTracker, RateLimiter, TenantCaps};
use wab_provider::ErrorClass;
use wab_queue::{JobConsumer, JobPublisher};
use wab_store::{
    Attribution, BatchRecipient, BatchRepository, BatchStatus, Campaign, CampaignBatch,
    CampaignMessageRepository, CampaignRepository, CampaignStatus, Contact, ContactRepository,
    MessageStatus, PauseReason, RecipientUpdate, TemplateRepository, TotalsDelta,
    WorkspaceRepository,
};

/// Map a campaign-pausing provider class to the recorded pause reason.
fn pause_reason_for(class: &ErrorClass) -> Option<PauseReason> {
    match class {
        ErrorClass::AuthFatal => Some(PauseReason::TokenExpired),
        ErrorClass::AccountFatal {
            capability_revoked: true,
        } => Some(PauseReason::CapabilityRevoked),
        ErrorClass::AccountFatal {
            capability_revoked: false,
        } => Some(PauseReason::AccountBlocked),
        ErrorClass::TemplateFatal => Some(PauseReason::TemplateRevoked),
        _ => None,
    }
}

pub struct JobHandler {
    service: Arc<CampaignService>,
    sender: TemplateSender,
    platform: Platform,
}

impl JobHandler {
    pub fn new(service: Arc<CampaignService>) -> Self {
        let platform = service.platform().clone();
        Self {
            sender: TemplateSender::new(platform.clone()),
            service,
            platform,
        }
    }

    pub async fn handle(&self, job: &CampaignJob) -> JobOutcome {
        let outcome = match job.kind {
            JobKind::CampaignStart => self.handle_campaign_start(job).await,
            JobKind::BatchProcess => self.handle_batch_process(job).await,
            JobKind::CampaignCheck => self.handle_campaign_check(job).await,
            JobKind::ScheduledStart => self.handle_scheduled_start(job).await,
        };
        metrics::counter!("wab_jobs_processed_total").increment(1);
        outcome
    }

    // ------------------------------------------------------------------
    // campaign-start
    // ------------------------------------------------------------------

    async fn handle_campaign_start(&self, job: &CampaignJob) -> JobOutcome {
        let campaign = match self.platform.store.campaigns.find_by_id(&job.campaign_id).await {
            Ok(Some(campaign)) => campaign,
            Ok(None) => return JobOutcome::Failed("campaign not found".to_string()),
            Err(e) => return JobOutcome::Failed(e.to_string()),
        };
        if campaign.status != CampaignStatus::Running {
            debug!(campaign_id = %campaign.id, status = ?campaign.status, "Start job standing down");
            return JobOutcome::Completed;
        }

        // The template must still be approved at execution time.
        match self
            .platform
            .store
            .templates
            .find_by_id(&campaign.tenant_id, &campaign.template.template_id)
            .await
        {
            Ok(Some(template)) if template.is_sendable() => {}
            Ok(_) => {
                let _ = self
                    .service
                    .system_pause(&campaign.id, PauseReason::TemplateRevoked)
                    .await;
                return JobOutcome::Completed;
            }
            Err(e) => return JobOutcome::Failed(e.to_string()),
        }

        let recipients = match self
            .platform
            .store
            .contacts
            .resolve_recipients(&campaign.tenant_id, &campaign.recipients)
            .await
        {
            Ok(recipients) => recipients,
            Err(e) => return JobOutcome::Failed(e.to_string()),
        };
        if recipients.is_empty() {
            let _ = self.service.fail(&campaign.id, "recipient set is empty").await;
            return JobOutcome::Completed;
        }

        // Idempotent re-run: keep existing batches from a prior attempt.
        let batches = match self.platform.store.batches.find_by_campaign(&campaign.id).await {
            Ok(existing) if !existing.is_empty() => existing,
            Ok(_) => {
                let batch_size = campaign.batching.batch_size.max(1) as usize;
                let batches: Vec<CampaignBatch> = recipients
                    .chunks(batch_size)
                    .enumerate()
                    .map(|(index, chunk)| {
                        CampaignBatch::new(
                            &campaign.id,
                            &campaign.tenant_id,
                            index as u32,
                            chunk
                                .iter()
                                .map(|c| BatchRecipient::new(&c.id, &c.phone))
                                .collect(),
                        )
                    })
                    .collect();
                if let Err(e) = self.platform.store.batches.insert_many(&batches).await {
                    return JobOutcome::Failed(e.to_string());
                }
                batches
            }
            Err(e) => return JobOutcome::Failed(e.to_string()),
        };

        if let Err(e) = self
            .platform
            .store
            .campaigns
            .set_batching_plan(
                &campaign.id,
                recipients.len() as u64,
                campaign.batching.batch_size,
                batches.len() as u32,
            )
            .await
        {
            return JobOutcome::Failed(e.to_string());
        }

        let stagger = self.platform.config.batch_stagger.as_secs() as u32;
        for batch in &batches {
            if let Err(e) = self
                .platform
                .queue
                .publish_delayed(
                    CampaignJob::batch(&campaign.id, &campaign.tenant_id, &batch.id, batch.index),
                    stagger * batch.index,
                )
                .await
            {
                return JobOutcome::Failed(e.to_string());
            }
        }

        // Completion check fires after the estimated run plus grace.
        let estimate = (recipients.len() as f64
            / self.platform.config.estimated_sends_per_second.max(0.1))
            as u32;
        if let Err(e) = self
            .platform
            .queue
            .publish_delayed(
                CampaignJob::check(&campaign.id, &campaign.tenant_id),
                estimate + 30,
            )
            .await
        {
            return JobOutcome::Failed(e.to_string());
        }

        info!(
            campaign_id = %campaign.id,
            recipients = recipients.len(),
            batches = batches.len(),
            "Campaign fan-out planned"
        );
        JobOutcome::Completed
    }

    // ------------------------------------------------------------------
    // batch-process
    // ------------------------------------------------------------------

    async fn handle_batch_process(&self, job: &CampaignJob) -> JobOutcome {
        let Some(batch_id) = &job.batch_id else {
            return JobOutcome::Failed("batch job without batch id".to_string());
        };

        let batch = match self.platform.store.batches.find_by_id(batch_id).await {
            Ok(Some(batch)) => batch,
            Ok(None) => return JobOutcome::Failed(format!("batch {batch_id} not found")),
            Err(e) => return JobOutcome::Failed(e.to_string()),
        };

        // Batch finality: a COMPLETED batch never re-emits.
        if batch.status == BatchStatus::Completed {
            debug!(batch_id = %batch.id, "Batch already completed");
            return JobOutcome::Completed;
        }

        let now = Utc::now();
        let stale_after = ChronoDuration::from_std(self.platform.config.stale_processing_after)
            .unwrap_or_else(|_| ChronoDuration::minutes(10));

        if batch.status == BatchStatus::Processing {
            if !batch.is_stale_processing(now, stale_after) {
                // Another worker owns it; nothing to do.
                return JobOutcome::Completed;
            }
            let cutoff = now - stale_after;
            match self
                .platform
                .store
                .batches
                .reclaim_stale_processing(&batch.id, cutoff, now)
                .await
            {
                Ok(true) => {
                    warn!(batch_id = %batch.id, "Reclaimed stale PROCESSING batch");
                }
                Ok(false) => return JobOutcome::Completed,
                Err(e) => return JobOutcome::Failed(e.to_string()),
            }
        }

        let campaign = match self.platform.store.campaigns.find_by_id(&job.campaign_id).await {
            Ok(Some(campaign)) => campaign,
            Ok(None) => return JobOutcome::Failed("campaign not found".to_string()),
            Err(e) => return JobOutcome::Failed(e.to_string()),
        };
        if campaign.status != CampaignStatus::Running {
            let _ = self
                .platform
                .store
                .batches
                .try_transition(
                    &batch.id,
                    &[BatchStatus::Pending, BatchStatus::Queued, BatchStatus::Processing],
                    BatchStatus::Paused,
                )
                .await;
            return JobOutcome::Completed;
        }

        // Campaign-wide backoff window from upstream rate limiting.
        match self.platform.backoff.should_wait(&campaign.id).await {
            Ok(Some(wait)) => {
                debug!(campaign_id = %campaign.id, wait_ms = wait.as_millis() as u64, "Backoff active");
                return JobOutcome::RetryAfter(wait);
            }
            Ok(None) => {}
            Err(e) => return JobOutcome::Failed(e.to_string()),
        }

        if batch.status != BatchStatus::Processing {
            match self.platform.store.batches.mark_processing(&batch.id, now).await {
                Ok(true) => {}
                Ok(false) => return JobOutcome::Completed,
                Err(e) => return JobOutcome::Failed(e.to_string()),
            }
        }

        self.process_recipients(&campaign, &batch).await
    }

    async fn process_recipients(&self, campaign: &Campaign, batch: &CampaignBatch) -> JobOutcome {
        let workspace = match self
            .platform
            .store
            .workspaces
            .find_by_id(&campaign.tenant_id)
            .await
        {
            Ok(Some(workspace)) => workspace,
            Ok(None) => return JobOutcome::Failed("workspace not found".to_string()),
            Err(e) => return JobOutcome::Failed(e.to_string()),
        };
        let phone_number_id = workspace
            .credentials
            .phone_number_id
            .clone()
            .unwrap_or_default();
        let caps = TenantCaps::default()
            .with_daily(
                workspace.effective_daily_cap(),
                workspace.messaging_tier.daily_recipient_cap(),
            )
            .with_monthly(workspace.effective_monthly_cap());

        let contact_ids: Vec<String> = batch
            .pending_recipients()
            .map(|r| r.contact_id.clone())
            .collect();
        let contacts = match self
            .platform
            .store
            .contacts
            .find_by_ids(&campaign.tenant_id, &contact_ids)
            .await
        {
            Ok(contacts) => contacts,
            Err(e) => return JobOutcome::Failed(e.to_string()),
        };
        let contact_by_id: std::collections::HashMap<&str, &Contact> =
            contacts.iter().map(|c| (c.id.as_str(), c)).collect();

        for recipient in batch.pending_recipients() {
            // Pause mid-batch must halt further sends; already-sent
            // recipients keep their state.
            match self.platform.store.campaigns.find_by_id(&campaign.id).await {
                Ok(Some(current)) if current.status == CampaignStatus::Running => {}
                Ok(_) => {
                    let _ = self
                        .platform
                        .store
                        .batches
                        .try_transition(&batch.id, &[BatchStatus::Processing], BatchStatus::Paused)
                        .await;
                    return JobOutcome::Completed;
                }
                Err(e) => return JobOutcome::Failed(e.to_string()),
            }

            let decision = match self
                .platform
                .limiter
                .check_and_consume(&campaign.tenant_id, &phone_number_id, &caps)
                .await
            {
                Ok(decision) => decision,
                Err(e) => return JobOutcome::Failed(e.to_string()),
            };
            if !decision.allowed {
                metrics::counter!("wab_rate_limit_hits_total").increment(1);
                let wait = decision.retry_after.unwrap_or(Duration::from_secs(30));
                let _ = self
                    .platform
                    .store
                    .batches
                    .try_transition(&batch.id, &[BatchStatus::Processing], BatchStatus::Queued)
                    .await;
                return JobOutcome::RetryAfter(wait);
            }

            let outcome = self.send_to_recipient(campaign, batch, recipient, &contact_by_id).await;
            match outcome {
                RecipientOutcome::Continue => {}
                RecipientOutcome::AbortBatch => return JobOutcome::Completed,
                RecipientOutcome::RetryAfter(wait) => {
                    let _ = self
                        .platform
                        .store
                        .batches
                        .try_transition(&batch.id, &[BatchStatus::Processing], BatchStatus::Queued)
                        .await;
                    return JobOutcome::RetryAfter(wait);
                }
                RecipientOutcome::JobFailed(reason) => return JobOutcome::Failed(reason),
            }

            tokio::time::sleep(self.platform.config.inter_message_pause).await;
        }

        // All recipients reached a final state: seal the batch.
        let now = Utc::now();
        match self.platform.store.batches.mark_completed(&batch.id, now).await {
            Ok(true) => {
                if let Err(e) = self
                    .platform
                    .store
                    .campaigns
                    .increment_completed_batches(&campaign.id)
                    .await
                {
                    return JobOutcome::Failed(e.to_string());
                }
            }
            Ok(false) => {}
            Err(e) => return JobOutcome::Failed(e.to_string()),
        }

        if let Err(e) = self.service.completion_check(&campaign.id).await {
            warn!(campaign_id = %campaign.id, error = %e, "Completion check failed");
        }
        JobOutcome::Completed
    }

    async fn send_to_recipient(
        &self,
        campaign: &Campaign,
        batch: &CampaignBatch,
        recipient: &BatchRecipient,
        contacts: &std::collections::HashMap<&str, &Contact>,
    ) -> RecipientOutcome {
        let Some(contact) = contacts.get(recipient.contact_id.as_str()) else {
            // Contact deleted between planning and execution.
            let _ = self
                .platform
                .store
                .batches
                .update_recipient(&batch.id, &recipient.contact_id, RecipientUpdate::skipped())
                .await;
            return RecipientOutcome::Continue;
        };

        let body_variables = build_body_variables(
            &campaign.variable_mapping,
            campaign.template.body_variable_count,
            contact,
        );

        let request = SendRequest {
            tenant_id: campaign.tenant_id.clone(),
            template: TemplateRef::Id(campaign.template.template_id.clone()),
            to: recipient.phone.clone(),
            header_variables: Vec::new(),
            body_variables,
            button_variables: Vec::new(),
            contact_id: Some(recipient.contact_id.clone()),
            attribution: Some(Attribution {
                campaign_id: campaign.id.clone(),
                batch_id: Some(batch.id.clone()),
                template_id: campaign.template.template_id.clone(),
            }),
        };

        match self.sender.send(&request).await {
            Ok(outcome) => {
                let _ = self
                    .platform
                    .store
                    .batches
                    .update_recipient(
                        &batch.id,
                        &recipient.contact_id,
                        RecipientUpdate::sent(outcome.provider_message_id.clone()),
                    )
                    .await;

                if !outcome.deduplicated {
                    let _ = self
                        .platform
                        .store
                        .campaign_messages
                        .upsert_send_outcome(
                            &campaign.id,
                            &recipient.contact_id,
                            &campaign.tenant_id,
                            MessageStatus::Sent,
                            Some(outcome.provider_message_id),
                            None,
                        )
                        .await;
                    let _ = self
                        .platform
                        .store
                        .campaigns
                        .increment_totals(
                            &campaign.id,
                            TotalsDelta {
                                queued: -1,
                                sent: 1,
                                ..Default::default()
                            },
                        )
                        .await;
                    let _ = self
                        .platform
                        .store
                        .campaigns
                        .clear_consecutive_failures(&campaign.id)
                        .await;
                }
                RecipientOutcome::Continue
            }
            Err(error) => self.handle_send_failure(campaign, batch, recipient, error).await,
        }
    }

    async fn handle_send_failure(
        &self,
        campaign: &Campaign,
        batch: &CampaignBatch,
        recipient: &BatchRecipient,
        error: EngineError,
    ) -> RecipientOutcome {
        let class = error.provider_class();

        // Upstream asked for breathing room: leave the recipient pending,
        // remember the deadline and hand the job back with the hint.
        if let Some(ErrorClass::RateLimit { retry_after }) = &class {
            let wait = retry_after.unwrap_or(Duration::from_secs(30));
            metrics::counter!("wab_rate_limit_hits_total").increment(1);
            if let Err(e) = self.platform.backoff.set_backoff(&campaign.id, wait).await {
                warn!(campaign_id = %campaign.id, error = %e, "Failed to record backoff");
            }
            return RecipientOutcome::RetryAfter(wait);
        }

        let provider_code = match &error {
            EngineError::Provider(e) => e.provider_code(),
            _ => None,
        };
        let message = error.to_string();

        let _ = self
            .platform
            .store
            .batches
            .update_recipient(
                &batch.id,
                &recipient.contact_id,
                RecipientUpdate::failed(message.clone()),
            )
            .await;
        let _ = self
            .platform
            .store
            .campaign_messages
            .upsert_send_outcome(
                &campaign.id,
                &recipient.contact_id,
                &campaign.tenant_id,
                MessageStatus::Failed,
                None,
                Some(message.clone()),
            )
            .await;
        let _ = self
            .platform
            .store
            .campaigns
            .increment_totals(
                &campaign.id,
                TotalsDelta {
                    queued: -1,
                    failed: 1,
                    ..Default::default()
                },
            )
            .await;
        let _ = self
            .platform
            .store
            .campaigns
            .record_send_failure(&campaign.id, &message, provider_code)
            .await;
        metrics::counter!("wab_send_failures_total").increment(1);

        // Account/template-level failures pause the whole campaign.
        let pause_reason = match &error {
            EngineError::TemplateNotApproved(_) => Some(PauseReason::TemplateRevoked),
            EngineError::WorkspaceNotConfigured(_) => Some(PauseReason::AccountDisabled),
            EngineError::PhoneNotConfigured(_) => Some(PauseReason::PhoneDisconnected),
            _ => class.as_ref().and_then(pause_reason_for),
        };
        if let Some(reason) = pause_reason {
            let _ = self.service.system_pause(&campaign.id, reason).await;
            let _ = self
                .platform
                .store
                .batches
                .try_transition(&batch.id, &[BatchStatus::Processing], BatchStatus::Paused)
                .await;
            return RecipientOutcome::AbortBatch;
        }

        // Consecutive-failure breach pauses even before the next
        // completion-check cycle.
        match self.platform.store.campaigns.find_by_id(&campaign.id).await {
            Ok(Some(current))
                if self
                    .platform
                    .config
                    .failure_policy
                    .consecutive_exceeded(current.failure.consecutive_failures) =>
            {
                let _ = self
                    .service
                    .system_pause(&campaign.id, PauseReason::HighFailureRate)
                    .await;
                let _ = self
                    .platform
                    .store
                    .batches
                    .try_transition(&batch.id, &[BatchStatus::Processing], BatchStatus::Paused)
                    .await;
                return RecipientOutcome::AbortBatch;
            }
            Ok(_) => {}
            Err(e) => return RecipientOutcome::JobFailed(e.to_string()),
        }

        RecipientOutcome::Continue
    }

    // ------------------------------------------------------------------
    // campaign-check
    // ------------------------------------------------------------------

    async fn handle_campaign_check(&self, job: &CampaignJob) -> JobOutcome {
        match self.service.completion_check(&job.campaign_id).await {
            Ok(CheckOutcome::InProgress) => {
                // Keep polling while the campaign is still live.
                match self.platform.store.campaigns.find_by_id(&job.campaign_id).await {
                    Ok(Some(campaign)) if campaign.status == CampaignStatus::Running => {
                        JobOutcome::RetryAfter(Duration::from_secs(30))
                    }
                    _ => JobOutcome::Completed,
                }
            }
            Ok(_) => JobOutcome::Completed,
            Err(EngineError::CampaignNotFound(_)) => JobOutcome::Completed,
            Err(e) => JobOutcome::Failed(e.to_string()),
        }
    }

    // ------------------------------------------------------------------
    // scheduled-start
    // ------------------------------------------------------------------

    async fn handle_scheduled_start(&self, job: &CampaignJob) -> JobOutcome {
        let campaign = match self.platform.store.campaigns.find_by_id(&job.campaign_id).await {
            Ok(Some(campaign)) => campaign,
            Ok(None) => return JobOutcome::Completed,
            Err(e) => return JobOutcome::Failed(e.to_string()),
        };
        if campaign.status != CampaignStatus::Scheduled {
            return JobOutcome::Completed;
        }

        match self
            .service
            .start(&job.campaign_id, &job.tenant_id, "scheduler")
            .await
        {
            Ok(()) => JobOutcome::Completed,
            Err(EngineError::CampaignAlreadyRunning { .. })
            | Err(EngineError::InvalidStatus { .. }) => JobOutcome::Completed,
            Err(EngineError::KillSwitchActive(_)) => {
                JobOutcome::RetryAfter(Duration::from_secs(300))
            }
            Err(e @ EngineError::PreflightFailed { .. })
            | Err(e @ EngineError::WorkspaceUnsafe(_)) => {
                let _ = self.service.fail(&job.campaign_id, &e.to_string()).await;
                JobOutcome::Completed
            }
            Err(e) => JobOutcome::Failed(e.to_string()),
        }
    }
}

enum RecipientOutcome {
    Continue,
    AbortBatch,
    RetryAfter(Duration),
    JobFailed(String),
}

// ============================================================================
// Worker pool runtime
// ============================================================================

type DirectLimiter = GovernorLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

pub struct WorkerPool {
    handler: Arc<JobHandler>,
    platform: Platform,
    retry_policy: JobRetryPolicy,
    global_limiter: Arc<DirectLimiter>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl WorkerPool {
    pub fn new(service: Arc<CampaignService>) -> Self {
        let platform = service.platform().clone();
        let per_second = NonZeroU32::new(platform.config.global_jobs_per_second)
            .unwrap_or(nonzero!(10u32));
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            handler: Arc::new(JobHandler::new(service)),
            platform,
            retry_policy: JobRetryPolicy::default(),
            global_limiter: Arc::new(GovernorLimiter::direct(Quota::per_second(per_second))),
            running: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let concurrency = self.platform.config.worker_concurrency.max(1);
        info!(concurrency = concurrency, "Starting campaign worker pool");

        for worker_index in 0..concurrency {
            let pool = self.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            debug!(worker = worker_index, "Worker shutting down");
                            break;
                        }
                        _ = pool.work_once() => {}
                    }
                }
            });
        }
    }

    async fn work_once(&self) {
        self.global_limiter.until_ready().await;

        let leased = match self.platform.queue.poll(1).await {
            Ok(leased) => leased,
            Err(e) => {
                error!(error = %e, "Queue poll failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                return;
            }
        };
        let Some(leased) = leased.into_iter().next() else {
            tokio::time::sleep(Duration::from_millis(500)).await;
            return;
        };

        debug!(
            job_key = %leased.job.job_key(),
            attempt = leased.attempt,
            "Handling job"
        );
        let outcome = self.handler.handle(&leased.job).await;

        let result = match outcome {
            JobOutcome::Completed => self.platform.queue.ack(&leased.receipt_handle).await,
            JobOutcome::RetryAfter(wait) => {
                self.platform
                    .queue
                    .defer(&leased.receipt_handle, wait.as_secs().max(1) as u32)
                    .await
            }
            JobOutcome::Failed(reason) => {
                warn!(
                    job_key = %leased.job.job_key(),
                    attempt = leased.attempt,
                    reason = %reason,
                    "Job failed"
                );
                let delay = self.backoff_with_jitter(leased.attempt);
                self.platform
                    .queue
                    .nack(&leased.receipt_handle, delay, Some(reason))
                    .await
            }
        };
        if let Err(e) = result {
            error!(error = %e, "Queue acknowledgement failed");
        }
    }

    fn backoff_with_jitter(&self, attempt: u32) -> u32 {
        let base = self.retry_policy.backoff_for_attempt(attempt).as_secs() as u32;
        let jitter = rand::rng().random_range(0..=base / 2 + 1);
        base + jitter
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}
