//! Campaign Execution Flow Tests
//!
//! End-to-end coverage of the orchestrator over in-memory backends and a
//! scripted provider:
//! - happy-path fan-out to COMPLETED
//! - batch finality across pause/resume (no duplicate provider sends)
//! - rate-limit backoff with the provider's retry hint
//! - template revocation mid-run (system pause, audit trail)
//! - failure-driven auto-pause
//! - idempotent replay of already-emitted recipients
//! - kill-switch / safety / lock / preflight gates on start

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wab_common::{CampaignJob, JobOutcome, MessagingTier, PlanTier, QualityRating};
use wab_engine::{
    CampaignService, CampaignSpec, EngineConfig, EngineError, JobHandler, MessagingProvider,
    Platform,
};
use wab_limits::{BackoffTracker, KillSwitch, MemoryBackoffTracker, MemoryKillSwitch, MemoryRateLimiter};
use wab_lock::{ExecutionLock, MemoryExecutionLock};
use wab_provider::{
    ErrorClass, MediaLink, PhoneCredentials, PhoneNumberInfo, ProviderError, SendResponse,
    SendResponseMessage, TemplateMessageRequest, TextMessageRequest,
};
use wab_queue::{JobConsumer, MemoryJobQueue};
use wab_store::{
    AuditAction, BatchRepository, BatchStatus, CampaignMessageRepository, CampaignRepository,
    CampaignStatus, Contact, ContactRepository, PauseReason, PhoneStatus, RecipientSpec, Store,
    Template, TemplateCategory, TemplateRepository, TemplateStatus, Workspace,
    WorkspaceRepository,
};

// ----------------------------------------------------------------------
// Scripted provider
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum PlannedFailure {
    RateLimit { retry_after_secs: u64 },
    InvalidRecipient,
    Temporary,
    TemplateFatal,
}

impl PlannedFailure {
    fn to_error(self) -> ProviderError {
        let (class, code) = match self {
            PlannedFailure::RateLimit { retry_after_secs } => (
                ErrorClass::RateLimit {
                    retry_after: Some(Duration::from_secs(retry_after_secs)),
                },
                130429,
            ),
            PlannedFailure::InvalidRecipient => (ErrorClass::InvalidRecipient, 131026),
            PlannedFailure::Temporary => (ErrorClass::Temporary, 1),
            PlannedFailure::TemplateFatal => (ErrorClass::TemplateFatal, 132015),
        };
        ProviderError::Api {
            class,
            code,
            message: "scripted failure".to_string(),
            status: 400,
        }
    }
}

/// Records every template send and fails scripted call indices (0-based).
#[derive(Default)]
struct MockProvider {
    calls: AtomicU32,
    sent: Mutex<Vec<(String, Vec<String>)>>,
    failures: Mutex<HashMap<u32, PlannedFailure>>,
}

impl MockProvider {
    fn fail_call(&self, index: u32, failure: PlannedFailure) {
        self.failures.lock().insert(index, failure);
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn sent(&self) -> Vec<(String, Vec<String>)> {
        self.sent.lock().clone()
    }

    fn body_params(request: &TemplateMessageRequest) -> Vec<String> {
        request
            .template
            .components
            .iter()
            .filter(|c| c.component_type == wab_provider::ComponentType::Body)
            .flat_map(|c| c.parameters.iter())
            .filter_map(|p| match p {
                wab_provider::Parameter::Text { text } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl MessagingProvider for MockProvider {
    async fn send_template(
        &self,
        _creds: &PhoneCredentials,
        request: &TemplateMessageRequest,
    ) -> wab_provider::Result<SendResponse> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.failures.lock().get(&index).copied() {
            return Err(failure.to_error());
        }
        self.sent
            .lock()
            .push((request.to.clone(), Self::body_params(request)));
        Ok(SendResponse {
            messaging_product: "whatsapp".to_string(),
            contacts: Vec::new(),
            messages: vec![SendResponseMessage {
                id: format!("wamid.TEST{index}"),
            }],
        })
    }

    async fn send_text(
        &self,
        _creds: &PhoneCredentials,
        _request: &TextMessageRequest,
    ) -> wab_provider::Result<SendResponse> {
        unimplemented!("campaign flow never sends session text")
    }

    async fn send_media(
        &self,
        _creds: &PhoneCredentials,
        _to: &str,
        _kind: &str,
        _media: MediaLink,
    ) -> wab_provider::Result<SendResponse> {
        unimplemented!("campaign flow never sends media")
    }

    async fn fetch_phone_number(
        &self,
        _creds: &PhoneCredentials,
    ) -> wab_provider::Result<PhoneNumberInfo> {
        unimplemented!("campaign flow never fetches phone info")
    }
}

// ----------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------

struct Harness {
    platform: Platform,
    service: Arc<CampaignService>,
    handler: JobHandler,
    provider: Arc<MockProvider>,
    queue: Arc<MemoryJobQueue>,
    kill_switch: Arc<MemoryKillSwitch>,
    lock: Arc<MemoryExecutionLock>,
}

fn harness() -> Harness {
    let provider = Arc::new(MockProvider::default());
    let queue = Arc::new(MemoryJobQueue::default());
    let kill_switch = Arc::new(MemoryKillSwitch::new());
    let lock = Arc::new(MemoryExecutionLock::new());

    let config = EngineConfig {
        owner_id: "test-worker".to_string(),
        inter_message_pause: Duration::ZERO,
        batch_stagger: Duration::ZERO,
        estimated_sends_per_second: 10_000.0,
        ..EngineConfig::default()
    };

    let platform = Platform {
        store: Store::memory(),
        lock: lock.clone(),
        limiter: Arc::new(MemoryRateLimiter::new()),
        backoff: Arc::new(MemoryBackoffTracker::new()),
        kill_switch: kill_switch.clone(),
        provider: provider.clone(),
        queue: queue.clone(),
        config: Arc::new(config),
    };

    let service = Arc::new(CampaignService::new(platform.clone()));
    let handler = JobHandler::new(service.clone());

    Harness {
        platform,
        service,
        handler,
        provider,
        queue,
        kill_switch,
        lock,
    }
}

impl Harness {
    async fn seed_workspace(&self) -> Workspace {
        let mut workspace = Workspace::new("t1", "Acme", PlanTier::Basic);
        workspace.credentials.access_token = Some("token".to_string());
        workspace.credentials.token_expires_at = Some(Utc::now() + ChronoDuration::days(60));
        workspace.credentials.phone_number_id = Some("phone-1".to_string());
        workspace.credentials.business_account_id = Some("waba-1".to_string());
        workspace.phone_status = PhoneStatus::Connected;
        workspace.quality_rating = QualityRating::Green;
        workspace.messaging_tier = MessagingTier::Tier1k;
        self.platform.store.workspaces.insert(&workspace).await.unwrap();
        workspace
    }

    async fn seed_template(&self) -> Template {
        let now = Utc::now();
        let template = Template {
            id: "tpl-order".to_string(),
            tenant_id: "t1".to_string(),
            name: "order_update".to_string(),
            language: "en_US".to_string(),
            category: TemplateCategory::Utility,
            status: TemplateStatus::Approved,
            header: None,
            body: "Hi {{1}}, your order shipped.".to_string(),
            footer: None,
            buttons: Vec::new(),
            provider_template_id: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.platform.store.templates.insert(&template).await.unwrap();
        template
    }

    async fn seed_contacts(&self, count: usize) -> Vec<Contact> {
        let mut contacts = Vec::new();
        for i in 0..count {
            let mut contact = Contact::new("t1", format!("1555000{i:04}"));
            contact.name = Some(format!("Contact {i}"));
            // Stable resolution order for assertions.
            contact.created_at = Utc::now() + ChronoDuration::milliseconds(i as i64);
            self.platform.store.contacts.insert(&contact).await.unwrap();
            contacts.push(contact);
        }
        contacts
    }

    fn spec(batch_size: u32) -> CampaignSpec {
        CampaignSpec {
            name: "spring-launch".to_string(),
            template_id: "tpl-order".to_string(),
            recipients: RecipientSpec::All,
            variable_mapping: HashMap::from([("1".to_string(), "name".to_string())]),
            scheduled_at: None,
            batch_size: Some(batch_size),
        }
    }

    /// Poll-and-handle until nothing is visible. Deferred jobs with real
    /// delays stay invisible, which ends the loop.
    async fn run_all(&self) {
        for _ in 0..500 {
            let jobs = self.queue.poll(5).await.unwrap();
            if jobs.is_empty() {
                return;
            }
            for leased in jobs {
                match self.handler.handle(&leased.job).await {
                    JobOutcome::Completed => {
                        self.queue.ack(&leased.receipt_handle).await.unwrap()
                    }
                    JobOutcome::RetryAfter(wait) => self
                        .queue
                        .defer(&leased.receipt_handle, wait.as_secs().max(1) as u32)
                        .await
                        .unwrap(),
                    JobOutcome::Failed(reason) => self
                        .queue
                        .nack(&leased.receipt_handle, 60, Some(reason))
                        .await
                        .unwrap(),
                }
            }
        }
        panic!("queue did not drain");
    }

    /// Handle exactly one visible job, returning its outcome.
    async fn step(&self) -> Option<(CampaignJob, JobOutcome)> {
        let leased = self.queue.poll(1).await.unwrap().into_iter().next()?;
        let outcome = self.handler.handle(&leased.job).await;
        match &outcome {
            JobOutcome::Completed => self.queue.ack(&leased.receipt_handle).await.unwrap(),
            JobOutcome::RetryAfter(wait) => self
                .queue
                .defer(&leased.receipt_handle, wait.as_secs().max(1) as u32)
                .await
                .unwrap(),
            JobOutcome::Failed(reason) => self
                .queue
                .nack(&leased.receipt_handle, 60, Some(reason.clone()))
                .await
                .unwrap(),
        }
        Some((leased.job, outcome))
    }
}

// ----------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------

#[tokio::test]
async fn happy_path_runs_to_completed() {
    let h = harness();
    h.seed_workspace().await;
    h.seed_template().await;
    h.seed_contacts(3).await;

    let campaign = h.service.create("t1", Harness::spec(50), "alice").await.unwrap();
    h.service.start(&campaign.id, "t1", "alice").await.unwrap();
    h.run_all().await;

    let done = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(done.status, CampaignStatus::Completed);
    assert!(done.completed_at.is_some());
    assert_eq!(done.totals.total_recipients, 3);
    assert_eq!(done.totals.sent, 3);
    assert_eq!(done.totals.failed, 0);
    assert_eq!(done.totals.queued, 0);

    // Exactly one provider POST per recipient, body = [name].
    let sent = h.provider.sent();
    assert_eq!(sent.len(), 3);
    for (i, (_, body)) in sent.iter().enumerate() {
        assert_eq!(body, &vec![format!("Contact {i}")]);
    }

    // All batches sealed.
    let batches = h.platform.store.batches.find_by_campaign(&campaign.id).await.unwrap();
    assert!(batches.iter().all(|b| b.status == BatchStatus::Completed));

    // Lifecycle audit trail.
    let actions: Vec<AuditAction> = done.audit.iter().map(|a| a.action).collect();
    assert!(actions.contains(&AuditAction::Created));
    assert!(actions.contains(&AuditAction::Started));
    assert!(actions.contains(&AuditAction::Completed));
}

#[tokio::test]
async fn resume_never_reenqueues_completed_batches() {
    let h = harness();
    h.seed_workspace().await;
    h.seed_template().await;
    h.seed_contacts(5).await;

    let campaign = h.service.create("t1", Harness::spec(1), "alice").await.unwrap();
    h.service.start(&campaign.id, "t1", "alice").await.unwrap();

    // campaign-start job plans 5 single-recipient batches.
    let (job, outcome) = h.step().await.unwrap();
    assert_eq!(job.kind, wab_common::JobKind::CampaignStart);
    assert_eq!(outcome, JobOutcome::Completed);

    // Complete exactly two batches, then pause.
    for _ in 0..2 {
        let (job, outcome) = h.step().await.unwrap();
        assert_eq!(job.kind, wab_common::JobKind::BatchProcess);
        assert_eq!(outcome, JobOutcome::Completed);
    }
    assert_eq!(h.provider.call_count(), 2);

    h.service.pause(&campaign.id, "t1", "alice", None).await.unwrap();

    let paused = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(paused.status, CampaignStatus::Paused);
    assert_eq!(paused.paused_reason, Some(PauseReason::UserPaused));

    let batches = h.platform.store.batches.find_by_campaign(&campaign.id).await.unwrap();
    assert_eq!(
        batches.iter().filter(|b| b.status == BatchStatus::Completed).count(),
        2
    );
    assert_eq!(
        batches.iter().filter(|b| b.status == BatchStatus::Paused).count(),
        3
    );

    // Resume re-enqueues only the three non-final batches.
    h.service.resume(&campaign.id, "t1", "alice").await.unwrap();
    h.run_all().await;

    let done = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(done.status, CampaignStatus::Completed);
    assert_eq!(done.totals.sent, 5);

    // Batch finality: completed batches never re-emitted, so exactly one
    // provider send per recipient overall.
    assert_eq!(h.provider.call_count(), 5);
    let mut recipients: Vec<String> = h.provider.sent().into_iter().map(|(to, _)| to).collect();
    recipients.sort();
    recipients.dedup();
    assert_eq!(recipients.len(), 5);
}

#[tokio::test]
async fn replaying_a_completed_batch_emits_nothing() {
    let h = harness();
    h.seed_workspace().await;
    h.seed_template().await;
    h.seed_contacts(2).await;

    let campaign = h.service.create("t1", Harness::spec(50), "alice").await.unwrap();
    h.service.start(&campaign.id, "t1", "alice").await.unwrap();
    h.run_all().await;
    assert_eq!(h.provider.call_count(), 2);

    // Inject a replayed batch job for the (now COMPLETED) batch.
    let batch = h
        .platform
        .store
        .batches
        .find_by_campaign(&campaign.id)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(batch.status, BatchStatus::Completed);

    let replay = CampaignJob::batch(&campaign.id, "t1", &batch.id, batch.index);
    let outcome = h.handler.handle(&replay).await;
    assert_eq!(outcome, JobOutcome::Completed);
    assert_eq!(h.provider.call_count(), 2, "replay must not re-send");
}

#[tokio::test]
async fn already_emitted_recipient_is_skipped_on_retry() {
    let h = harness();
    h.seed_workspace().await;
    h.seed_template().await;
    let contacts = h.seed_contacts(3).await;

    let campaign = h.service.create("t1", Harness::spec(50), "alice").await.unwrap();

    // Pretend the first contact was already charged in an earlier attempt.
    h.platform
        .store
        .campaign_messages
        .upsert_send_outcome(
            &campaign.id,
            &contacts[0].id,
            "t1",
            wab_store::MessageStatus::Sent,
            Some("wamid.EARLIER".to_string()),
            None,
        )
        .await
        .unwrap();

    h.service.start(&campaign.id, "t1", "alice").await.unwrap();
    h.run_all().await;

    // Only the two unsent contacts hit the provider.
    assert_eq!(h.provider.call_count(), 2);
    let sent: Vec<String> = h.provider.sent().into_iter().map(|(to, _)| to).collect();
    assert!(!sent.contains(&contacts[0].phone));

    let done = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(done.status, CampaignStatus::Completed);
}

#[tokio::test]
async fn rate_limit_defers_batch_with_provider_hint() {
    let h = harness();
    h.seed_workspace().await;
    h.seed_template().await;
    h.seed_contacts(10).await;

    // 5th send (index 4) gets a 429 with retryAfter=15s.
    h.provider.fail_call(4, PlannedFailure::RateLimit { retry_after_secs: 15 });

    let campaign = h.service.create("t1", Harness::spec(50), "alice").await.unwrap();
    h.service.start(&campaign.id, "t1", "alice").await.unwrap();

    let (_, outcome) = h.step().await.unwrap(); // campaign-start
    assert_eq!(outcome, JobOutcome::Completed);

    let (job, outcome) = h.step().await.unwrap(); // batch hits the 429
    assert_eq!(job.kind, wab_common::JobKind::BatchProcess);
    match outcome {
        JobOutcome::RetryAfter(wait) => assert!(wait >= Duration::from_secs(15)),
        other => panic!("expected RetryAfter, got {other:?}"),
    }

    // Four real sends before the limit; rate-limited recipient untouched.
    let running = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(running.totals.sent, 4);
    assert_eq!(running.totals.failed, 0);

    // Backoff deadline recorded against the campaign.
    assert!(h.platform.backoff.should_wait(&campaign.id).await.unwrap().is_some());

    // Once the window passes, the same batch job finishes the remainder.
    h.platform.backoff.clear(&campaign.id).await.unwrap();
    let outcome = h.handler.handle(&job).await;
    assert_eq!(outcome, JobOutcome::Completed);

    let done = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(done.totals.sent, 10);
    assert_eq!(done.totals.failed, 0);
    assert_eq!(done.status, CampaignStatus::Completed);
}

#[tokio::test]
async fn template_revocation_mid_run_system_pauses() {
    let h = harness();
    h.seed_workspace().await;
    let template = h.seed_template().await;
    h.seed_contacts(4).await;

    let campaign = h.service.create("t1", Harness::spec(2), "alice").await.unwrap();
    h.service.start(&campaign.id, "t1", "alice").await.unwrap();

    // Plan batches, send the first one.
    let _ = h.step().await.unwrap(); // start
    let _ = h.step().await.unwrap(); // batch 0
    assert_eq!(h.provider.call_count(), 2);

    // The provider rejects the template between batches.
    h.platform
        .store
        .templates
        .set_status(&template.id, TemplateStatus::Rejected, None)
        .await
        .unwrap();

    h.run_all().await;

    let paused = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(paused.status, CampaignStatus::Paused);
    assert_eq!(paused.paused_reason, Some(PauseReason::TemplateRevoked));

    let system_entry = paused
        .audit
        .iter()
        .find(|a| a.action == AuditAction::SystemPaused)
        .expect("system pause audit entry");
    assert!(system_entry.system_initiated);

    // The revocation is observed before the provider is touched: only the
    // first batch's two sends ever happened.
    assert_eq!(h.provider.call_count(), 2);
}

#[tokio::test]
async fn consecutive_failures_auto_pause() {
    let h = harness();
    h.seed_workspace().await;
    h.seed_template().await;
    h.seed_contacts(20).await;

    // Every send bounces off an invalid recipient.
    for i in 0..20 {
        h.provider.fail_call(i, PlannedFailure::InvalidRecipient);
    }

    let campaign = h.service.create("t1", Harness::spec(50), "alice").await.unwrap();
    h.service.start(&campaign.id, "t1", "alice").await.unwrap();
    h.run_all().await;

    let paused = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(paused.status, CampaignStatus::Paused);
    assert_eq!(paused.paused_reason, Some(PauseReason::HighFailureRate));
    // Ten consecutive failures tripped the policy; the batch aborted there.
    assert_eq!(paused.totals.failed, 10);
    assert_eq!(paused.failure.consecutive_failures, 10);
}

#[tokio::test]
async fn failure_rate_auto_pause_after_fifty_processed() {
    let h = harness();
    h.seed_workspace().await;
    h.seed_template().await;
    h.seed_contacts(60).await;

    // Alternate failures: 50% failure rate, consecutive counter never
    // reaches the threshold.
    for i in (0..60).step_by(2) {
        h.provider.fail_call(i, PlannedFailure::InvalidRecipient);
    }

    let campaign = h.service.create("t1", Harness::spec(60), "alice").await.unwrap();
    h.service.start(&campaign.id, "t1", "alice").await.unwrap();
    h.run_all().await;

    let paused = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(paused.status, CampaignStatus::Paused);
    assert_eq!(paused.paused_reason, Some(PauseReason::HighFailureRate));

    let totals = paused.totals;
    assert!(totals.processed() >= 50);
    assert!(totals.failure_rate() >= 0.30);
}

#[tokio::test]
async fn start_is_blocked_by_kill_switch_and_lock() {
    let h = harness();
    h.seed_workspace().await;
    h.seed_template().await;
    h.seed_contacts(1).await;

    let campaign = h.service.create("t1", Harness::spec(50), "alice").await.unwrap();

    h.kill_switch.activate("drill").await.unwrap();
    let err = h.service.start(&campaign.id, "t1", "alice").await.unwrap_err();
    assert_eq!(err.kind(), "KILL_SWITCH_ACTIVE");
    h.kill_switch.clear().await.unwrap();

    // A foreign lease blocks start with CAMPAIGN_ALREADY_RUNNING.
    h.lock
        .acquire(&campaign.id, "other-node", Duration::from_secs(60))
        .await
        .unwrap();
    let err = h.service.start(&campaign.id, "t1", "alice").await.unwrap_err();
    assert_eq!(err.kind(), "CAMPAIGN_ALREADY_RUNNING");
    h.lock.release(&campaign.id, "other-node", false).await.unwrap();

    h.service.start(&campaign.id, "t1", "alice").await.unwrap();
    h.run_all().await;
    assert_eq!(h.provider.call_count(), 1);
}

#[tokio::test]
async fn preflight_blocks_red_quality_and_releases_lock() {
    let h = harness();
    let mut workspace = h.seed_workspace().await;
    h.seed_template().await;
    h.seed_contacts(1).await;

    workspace.quality_rating = QualityRating::Red;
    h.platform.store.workspaces.update(&workspace).await.unwrap();

    let campaign = h.service.create("t1", Harness::spec(50), "alice").await.unwrap();
    let err = h.service.start(&campaign.id, "t1", "alice").await.unwrap_err();
    // RED quality trips the safety gate before preflight even runs.
    assert_eq!(err.kind(), "WORKSPACE_UNSAFE");

    // Recovering the rating lets the same campaign start: the failed
    // attempt left no dangling lease.
    workspace.quality_rating = QualityRating::Green;
    h.platform.store.workspaces.update(&workspace).await.unwrap();
    h.service.start(&campaign.id, "t1", "alice").await.unwrap();

    let running = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(running.status, CampaignStatus::Running);
}

#[tokio::test]
async fn preflight_blocks_tier_cap_overflow() {
    let h = harness();
    let mut workspace = h.seed_workspace().await;
    workspace.messaging_tier = MessagingTier::Tier50;
    h.platform.store.workspaces.update(&workspace).await.unwrap();
    h.seed_template().await;
    h.seed_contacts(60).await;

    let campaign = h.service.create("t1", Harness::spec(50), "alice").await.unwrap();
    let err = h.service.start(&campaign.id, "t1", "alice").await.unwrap_err();
    match err {
        EngineError::PreflightFailed { report } => {
            assert!(report
                .errors
                .iter()
                .any(|issue| issue.code == "TIER_LIMIT_EXCEEDED"));
        }
        other => panic!("expected PreflightFailed, got {other:?}"),
    }

    let campaign = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(campaign.status, CampaignStatus::Draft);
}

#[tokio::test]
async fn pause_requires_running_and_delete_refuses_running() {
    let h = harness();
    h.seed_workspace().await;
    h.seed_template().await;
    h.seed_contacts(1).await;

    let campaign = h.service.create("t1", Harness::spec(50), "alice").await.unwrap();

    let err = h.service.pause(&campaign.id, "t1", "alice", None).await.unwrap_err();
    assert_eq!(err.kind(), "INVALID_STATUS");

    h.service.start(&campaign.id, "t1", "alice").await.unwrap();
    let err = h.service.delete(&campaign.id, "t1").await.unwrap_err();
    assert_eq!(err.kind(), "INVALID_STATUS");
}

#[tokio::test]
async fn scheduled_campaign_promotes_via_scheduled_start_job() {
    let h = harness();
    h.seed_workspace().await;
    h.seed_template().await;
    h.seed_contacts(2).await;

    let mut spec = Harness::spec(50);
    spec.scheduled_at = Some(Utc::now() - ChronoDuration::seconds(1));
    let campaign = h.service.create("t1", spec, "alice").await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Scheduled);

    // The create path parked a scheduled-start job (delay already elapsed).
    h.run_all().await;

    let done = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(done.status, CampaignStatus::Completed);
    assert_eq!(done.totals.sent, 2);
}

#[tokio::test]
async fn temporary_send_errors_count_as_failures_but_do_not_pause() {
    let h = harness();
    h.seed_workspace().await;
    h.seed_template().await;
    h.seed_contacts(5).await;

    h.provider.fail_call(1, PlannedFailure::Temporary);

    let campaign = h.service.create("t1", Harness::spec(50), "alice").await.unwrap();
    h.service.start(&campaign.id, "t1", "alice").await.unwrap();
    h.run_all().await;

    let done = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(done.status, CampaignStatus::Completed);
    assert_eq!(done.totals.sent, 4);
    assert_eq!(done.totals.failed, 1);
    assert!(done.failure.last_error.is_some());
}

#[tokio::test]
async fn template_fatal_at_send_time_pauses_with_template_revoked() {
    let h = harness();
    h.seed_workspace().await;
    h.seed_template().await;
    h.seed_contacts(3).await;

    h.provider.fail_call(1, PlannedFailure::TemplateFatal);

    let campaign = h.service.create("t1", Harness::spec(50), "alice").await.unwrap();
    h.service.start(&campaign.id, "t1", "alice").await.unwrap();
    h.run_all().await;

    let paused = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(paused.status, CampaignStatus::Paused);
    assert_eq!(paused.paused_reason, Some(PauseReason::TemplateRevoked));
    // The batch aborted right after the fatal error.
    assert_eq!(h.provider.call_count(), 2);
}
