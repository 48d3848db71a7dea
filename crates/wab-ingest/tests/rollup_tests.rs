//! Webhook Rollup Tests
//!
//! Covers the ingester's hard guarantees over in-memory backends:
//! - monotonic message progression with out-of-order webhooks collapsed
//! - exactly-once campaign counter rollups (no double counting)
//! - counter conservation when a failure lands after progression
//! - tolerance of unknown provider message ids
//! - inbound ingestion: contact upsert, conversation anchor, reply
//!   attribution
//! - template / quality / tier / account propagation into system pauses

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use wab_automation::{AutomationEngine, LoggingCrmBridge};
use wab_common::{MessagingTier, PlanTier, QualityRating};
use wab_engine::{CampaignService, EngineConfig, MessagingProvider, Platform};
use wab_limits::{MemoryBackoffTracker, MemoryKillSwitch, MemoryRateLimiter};
use wab_lock::MemoryExecutionLock;
use wab_provider::{
    Change, ChangeValue, Entry, InboundMessage, InboundText, MediaLink, Metadata,
    PhoneCredentials, PhoneNumberInfo, SendResponse, SendResponseMessage, StatusEvent,
    StatusError, TemplateMessageRequest, TextMessageRequest, WebhookEnvelope, FIELD_ACCOUNT,
    FIELD_MESSAGES, FIELD_QUALITY, FIELD_TEMPLATE_STATUS,
};
use wab_ingest::{TenantRouter, WebhookIngester};
use wab_queue::MemoryJobQueue;
use wab_store::{
    Attribution, AuditAction, BatchRepository, CampaignMessageRepository, CampaignRepository,
    CampaignStatus, Contact, ContactRepository, ConversationRepository, Message,
    MessageKind, MessageRepository, MessageStatus, PauseReason, PhoneStatus, RecipientSpec,
    Store, Template, TemplateCategory, TemplateRepository, TemplateSnapshot, TemplateStatus,
    Workspace, WorkspaceRepository,
};

struct NoopProvider;

#[async_trait]
impl MessagingProvider for NoopProvider {
    async fn send_template(
        &self,
        _creds: &PhoneCredentials,
        _request: &TemplateMessageRequest,
    ) -> wab_provider::Result<SendResponse> {
        Ok(ok_response())
    }

    async fn send_text(
        &self,
        _creds: &PhoneCredentials,
        _request: &TextMessageRequest,
    ) -> wab_provider::Result<SendResponse> {
        Ok(ok_response())
    }

    async fn send_media(
        &self,
        _creds: &PhoneCredentials,
        _to: &str,
        _kind: &str,
        _media: MediaLink,
    ) -> wab_provider::Result<SendResponse> {
        Ok(ok_response())
    }

    async fn fetch_phone_number(
        &self,
        _creds: &PhoneCredentials,
    ) -> wab_provider::Result<PhoneNumberInfo> {
        unimplemented!("rollup tests never fetch phone info")
    }
}

fn ok_response() -> SendResponse {
    SendResponse {
        messaging_product: "whatsapp".to_string(),
        contacts: Vec::new(),
        messages: vec![SendResponseMessage {
            id: format!("wamid.OUT{}", uuid::Uuid::new_v4()),
        }],
    }
}

struct Harness {
    platform: Platform,
    ingester: WebhookIngester,
}

fn harness() -> Harness {
    let platform = Platform {
        store: Store::memory(),
        lock: Arc::new(MemoryExecutionLock::new()),
        limiter: Arc::new(MemoryRateLimiter::new()),
        backoff: Arc::new(MemoryBackoffTracker::new()),
        kill_switch: Arc::new(MemoryKillSwitch::new()),
        provider: Arc::new(NoopProvider),
        queue: Arc::new(MemoryJobQueue::default()),
        config: Arc::new(EngineConfig::default()),
    };

    let router = Arc::new(TenantRouter::new(platform.clone()));
    let service = Arc::new(CampaignService::new(platform.clone()));
    let automation = Arc::new(AutomationEngine::new(
        platform.clone(),
        Arc::new(LoggingCrmBridge),
    ));
    let ingester = WebhookIngester::new(platform.clone(), router, service, automation);

    Harness { platform, ingester }
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

    async fn seed_running_campaign(&self, total_recipients: u64) -> wab_store::Campaign {
        let mut campaign = wab_store::Campaign::new(
            "t1",
            "spring-launch",
            TemplateSnapshot {
                template_id: "tpl-order".to_string(),
                name: "order_update".to_string(),
                language: "en_US".to_string(),
                category: TemplateCategory::Utility,
                body_variable_count: 1,
            },
            RecipientSpec::All,
            HashMap::new(),
            None,
        );
        campaign.status = CampaignStatus::Running;
        campaign.totals.total_recipients = total_recipients;
        self.platform.store.campaigns.insert(&campaign).await.unwrap();
        campaign
    }

    /// An outbound campaign message already recorded as SENT (with the
    /// worker's totals increment), plus its campaign join record.
    async fn seed_sent_message(
        &self,
        campaign_id: &str,
        contact_id: &str,
        wamid: &str,
    ) -> Message {
        self.platform
            .store
            .campaigns
            .increment_totals(campaign_id, wab_store::TotalsDelta::sent(1))
            .await
            .unwrap();
        let message = Message::outbound_sent(
            "t1",
            Some(contact_id.to_string()),
            "15551234567",
            MessageKind::Template,
            Some("Hi Ada".to_string()),
            wamid,
            Some(Attribution {
                campaign_id: campaign_id.to_string(),
                batch_id: None,
                template_id: "tpl-order".to_string(),
            }),
        );
        self.platform.store.messages.insert(&message).await.unwrap();
        self.platform
            .store
            .campaign_messages
            .upsert_send_outcome(
                campaign_id,
                contact_id,
                "t1",
                MessageStatus::Sent,
                Some(wamid.to_string()),
                None,
            )
            .await
            .unwrap();
        message
    }
}

fn status_envelope(wamid: &str, status: &str, errors: Vec<StatusError>) -> WebhookEnvelope {
    WebhookEnvelope {
        object: "whatsapp_business_account".to_string(),
        entry: vec![Entry {
            id: "waba-1".to_string(),
            changes: vec![Change {
                field: FIELD_MESSAGES.to_string(),
                value: ChangeValue {
                    messaging_product: Some("whatsapp".to_string()),
                    metadata: Some(Metadata {
                        display_phone_number: "15550001111".to_string(),
                        phone_number_id: "phone-1".to_string(),
                    }),
                    statuses: vec![StatusEvent {
                        id: wamid.to_string(),
                        status: status.to_string(),
                        timestamp: Utc::now().timestamp().to_string(),
                        recipient_id: "15551234567".to_string(),
                        conversation: None,
                        pricing: None,
                        errors,
                    }],
                    ..Default::default()
                },
            }],
        }],
    }
}

fn inbound_envelope(from: &str, wamid: &str, text: &str, timestamp: i64) -> WebhookEnvelope {
    WebhookEnvelope {
        object: "whatsapp_business_account".to_string(),
        entry: vec![Entry {
            id: "waba-1".to_string(),
            changes: vec![Change {
                field: FIELD_MESSAGES.to_string(),
                value: ChangeValue {
                    messaging_product: Some("whatsapp".to_string()),
                    metadata: Some(Metadata {
                        display_phone_number: "15550001111".to_string(),
                        phone_number_id: "phone-1".to_string(),
                    }),
                    messages: vec![InboundMessage {
                        from: from.to_string(),
                        id: wamid.to_string(),
                        timestamp: timestamp.to_string(),
                        message_type: "text".to_string(),
                        text: Some(InboundText {
                            body: text.to_string(),
                        }),
                        image: None,
                        video: None,
                        document: None,
                        audio: None,
                        referral: None,
                    }],
                    ..Default::default()
                },
            }],
        }],
    }
}

fn waba_event(field: &str, value: ChangeValue) -> WebhookEnvelope {
    WebhookEnvelope {
        object: "whatsapp_business_account".to_string(),
        entry: vec![Entry {
            id: "waba-1".to_string(),
            changes: vec![Change {
                field: field.to_string(),
                value,
            }],
        }],
    }
}

// ----------------------------------------------------------------------
// Status rollup
// ----------------------------------------------------------------------

#[tokio::test]
async fn delivered_then_read_advance_and_count_once() {
    let h = harness();
    h.seed_workspace().await;
    let campaign = h.seed_running_campaign(3).await;
    h.seed_sent_message(&campaign.id, "c1", "wamid.X").await;

    h.ingester
        .process(&status_envelope("wamid.X", "delivered", vec![]))
        .await;
    h.ingester
        .process(&status_envelope("wamid.X", "read", vec![]))
        .await;

    let message = h
        .platform
        .store
        .messages
        .find_by_provider_message_id("wamid.X")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.status, MessageStatus::Read);
    assert!(message.delivered_at.is_some());
    assert!(message.read_at.is_some());

    let campaign = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(campaign.totals.delivered, 1);
    assert_eq!(campaign.totals.read, 1);
}

#[tokio::test]
async fn read_before_delivered_collapses_and_later_delivered_is_noop() {
    let h = harness();
    h.seed_workspace().await;
    let campaign = h.seed_running_campaign(3).await;
    h.seed_sent_message(&campaign.id, "c1", "wamid.X").await;

    // read arrives first: both delivered and read count exactly once
    h.ingester
        .process(&status_envelope("wamid.X", "read", vec![]))
        .await;

    let message = h
        .platform
        .store
        .messages
        .find_by_provider_message_id("wamid.X")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.status, MessageStatus::Read);
    assert!(message.read_at.is_some());

    let loaded = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(loaded.totals.delivered, 1);
    assert_eq!(loaded.totals.read, 1);

    // the late delivered webhook changes nothing
    h.ingester
        .process(&status_envelope("wamid.X", "delivered", vec![]))
        .await;

    let message = h
        .platform
        .store
        .messages
        .find_by_provider_message_id("wamid.X")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.status, MessageStatus::Read);

    let loaded = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(loaded.totals.delivered, 1);
    assert_eq!(loaded.totals.read, 1);
}

#[tokio::test]
async fn restated_status_never_double_counts() {
    let h = harness();
    h.seed_workspace().await;
    let campaign = h.seed_running_campaign(3).await;
    h.seed_sent_message(&campaign.id, "c1", "wamid.X").await;

    for _ in 0..3 {
        h.ingester
            .process(&status_envelope("wamid.X", "delivered", vec![]))
            .await;
    }

    let loaded = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(loaded.totals.delivered, 1);
}

#[tokio::test]
async fn failure_after_progression_conserves_counters() {
    let h = harness();
    h.seed_workspace().await;
    let mut campaign = h.seed_running_campaign(1).await;
    h.seed_sent_message(&campaign.id, "c1", "wamid.X").await;

    h.ingester
        .process(&status_envelope("wamid.X", "delivered", vec![]))
        .await;
    h.ingester
        .process(&status_envelope(
            "wamid.X",
            "failed",
            vec![StatusError {
                code: 131026,
                title: "Message undeliverable".to_string(),
                message: None,
            }],
        ))
        .await;

    let message = h
        .platform
        .store
        .messages
        .find_by_provider_message_id("wamid.X")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.status, MessageStatus::Failed);
    assert!(message.failed_at.is_some());

    campaign = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    let totals = campaign.totals;
    // conservation: the message moved from the progression buckets to failed
    assert_eq!(totals.failed, 1);
    assert_eq!(totals.sent, 0);
    assert_eq!(totals.delivered, 0);
    assert!(totals.sent + totals.failed <= totals.total_recipients);
    assert!(totals.delivered <= totals.sent);
    assert!(totals.read <= totals.delivered);

    // terminal sink: nothing advances a failed message
    h.ingester
        .process(&status_envelope("wamid.X", "read", vec![]))
        .await;
    let message = h
        .platform
        .store
        .messages
        .find_by_provider_message_id("wamid.X")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.status, MessageStatus::Failed);
}

#[tokio::test]
async fn unknown_provider_message_id_is_tolerated() {
    let h = harness();
    h.seed_workspace().await;

    // No message row exists; the ingester acknowledges and moves on.
    h.ingester
        .process(&status_envelope("wamid.GHOST", "delivered", vec![]))
        .await;
}

#[tokio::test]
async fn processed_total_triggers_completion_for_running_campaign() {
    let h = harness();
    h.seed_workspace().await;
    let campaign = h.seed_running_campaign(1).await;
    h.seed_sent_message(&campaign.id, "c1", "wamid.X").await;

    // One sealed batch so the completion check finds everything final.
    let mut batch = wab_store::CampaignBatch::new(
        &campaign.id,
        "t1",
        0,
        vec![{
            let mut r = wab_store::BatchRecipient::new("c1", "15551234567");
            r.status = wab_store::RecipientStatus::Sent;
            r
        }],
    );
    batch.status = wab_store::BatchStatus::Completed;
    h.platform.store.batches.insert_many(&[batch]).await.unwrap();

    h.ingester
        .process(&status_envelope("wamid.X", "delivered", vec![]))
        .await;

    let done = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(done.status, CampaignStatus::Completed);
}

// ----------------------------------------------------------------------
// Inbound ingestion
// ----------------------------------------------------------------------

#[tokio::test]
async fn inbound_message_creates_contact_conversation_and_anchor() {
    let h = harness();
    h.seed_workspace().await;

    let at = Utc::now().timestamp();
    h.ingester
        .process(&inbound_envelope("15557654321", "wamid.IN1", "hello", at))
        .await;

    let contact = h
        .platform
        .store
        .contacts
        .find_by_phone("t1", "15557654321")
        .await
        .unwrap()
        .expect("contact upserted");

    let conversation = h
        .platform
        .store
        .conversations
        .find_for_contact("t1", &contact.id)
        .await
        .unwrap()
        .expect("conversation opened");
    assert_eq!(
        conversation.last_customer_message_at.unwrap().timestamp(),
        at
    );
    assert_eq!(conversation.unread_count, 1);
    assert!(conversation.within_session_window(Utc::now()));

    // An older redelivered inbound never regresses the anchor.
    h.ingester
        .process(&inbound_envelope(
            "15557654321",
            "wamid.IN0",
            "earlier",
            at - 3_600,
        ))
        .await;
    let conversation = h
        .platform
        .store
        .conversations
        .find_for_contact("t1", &contact.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        conversation.last_customer_message_at.unwrap().timestamp(),
        at
    );
}

#[tokio::test]
async fn inbound_reply_attributes_to_latest_campaign_message() {
    let h = harness();
    h.seed_workspace().await;
    let campaign = h.seed_running_campaign(3).await;

    let contact = {
        let contact = Contact::new("t1", "15557654321");
        h.platform.store.contacts.insert(&contact).await.unwrap();
        contact
    };
    h.platform
        .store
        .campaign_messages
        .upsert_send_outcome(
            &campaign.id,
            &contact.id,
            "t1",
            MessageStatus::Sent,
            Some("wamid.X".to_string()),
            None,
        )
        .await
        .unwrap();

    let at = Utc::now().timestamp();
    h.ingester
        .process(&inbound_envelope("15557654321", "wamid.IN1", "yes!", at))
        .await;
    // A second reply does not double count.
    h.ingester
        .process(&inbound_envelope("15557654321", "wamid.IN2", "hello?", at + 5))
        .await;

    let loaded = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(loaded.totals.replied, 1);

    let cm = h
        .platform
        .store
        .campaign_messages
        .find(&campaign.id, &contact.id)
        .await
        .unwrap()
        .unwrap();
    assert!(cm.replied_at.is_some());
}

// ----------------------------------------------------------------------
// Template / quality / account propagation
// ----------------------------------------------------------------------

#[tokio::test]
async fn template_rejection_pauses_running_campaigns() {
    let h = harness();
    h.seed_workspace().await;

    let now = Utc::now();
    let template = Template {
        id: "tpl-order".to_string(),
        tenant_id: "t1".to_string(),
        name: "order_update".to_string(),
        language: "en_US".to_string(),
        category: TemplateCategory::Utility,
        status: TemplateStatus::Approved,
        header: None,
        body: "Hi {{1}}".to_string(),
        footer: None,
        buttons: Vec::new(),
        provider_template_id: None,
        rejection_reason: None,
        created_at: now,
        updated_at: now,
    };
    h.platform.store.templates.insert(&template).await.unwrap();
    let campaign = h.seed_running_campaign(1000).await;

    h.ingester
        .process(&waba_event(
            FIELD_TEMPLATE_STATUS,
            ChangeValue {
                event: Some("REJECTED".to_string()),
                message_template_name: Some("order_update".to_string()),
                message_template_language: Some("en_US".to_string()),
                reason: Some("INCORRECT_CATEGORY".to_string()),
                ..Default::default()
            },
        ))
        .await;

    let template = h
        .platform
        .store
        .templates
        .find_by_id("t1", "tpl-order")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(template.status, TemplateStatus::Rejected);

    let paused = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(paused.status, CampaignStatus::Paused);
    assert_eq!(paused.paused_reason, Some(PauseReason::TemplateRevoked));
    let entry = paused
        .audit
        .iter()
        .find(|a| a.action == AuditAction::SystemPaused)
        .expect("system pause audited");
    assert!(entry.system_initiated);
}

#[tokio::test]
async fn quality_flag_sets_red_and_pauses() {
    let h = harness();
    h.seed_workspace().await;
    let campaign = h.seed_running_campaign(10).await;

    h.ingester
        .process(&waba_event(
            FIELD_QUALITY,
            ChangeValue {
                event: Some("FLAGGED".to_string()),
                display_phone_number: Some("15550001111".to_string()),
                ..Default::default()
            },
        ))
        .await;

    let workspace = h.platform.store.workspaces.find_by_id("t1").await.unwrap().unwrap();
    assert_eq!(workspace.quality_rating, QualityRating::Red);

    let paused = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(paused.paused_reason, Some(PauseReason::QualityDegraded));
}

#[tokio::test]
async fn tier_downgrade_pauses_running_campaigns() {
    let h = harness();
    h.seed_workspace().await;
    let campaign = h.seed_running_campaign(10).await;

    h.ingester
        .process(&waba_event(
            FIELD_QUALITY,
            ChangeValue {
                current_limit: Some("TIER_250".to_string()),
                ..Default::default()
            },
        ))
        .await;

    let workspace = h.platform.store.workspaces.find_by_id("t1").await.unwrap().unwrap();
    assert_eq!(workspace.messaging_tier, MessagingTier::Tier250);

    let paused = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(paused.paused_reason, Some(PauseReason::TierDowngraded));
}

#[tokio::test]
async fn account_disable_blocks_workspace_and_pauses() {
    let h = harness();
    h.seed_workspace().await;
    let campaign = h.seed_running_campaign(10).await;

    h.ingester
        .process(&waba_event(
            FIELD_ACCOUNT,
            ChangeValue {
                event: Some("DISABLED_UPDATE".to_string()),
                ..Default::default()
            },
        ))
        .await;

    let workspace = h.platform.store.workspaces.find_by_id("t1").await.unwrap().unwrap();
    assert!(workspace.blocked);

    let paused = h.platform.store.campaigns.find_by_id(&campaign.id).await.unwrap().unwrap();
    assert_eq!(paused.paused_reason, Some(PauseReason::AccountBlocked));
}
