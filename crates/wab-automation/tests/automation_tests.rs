//! Automation Rule Engine Tests
//!
//! Covers the hard rules: the 24-hour session gate on text/media actions,
//! template approval re-checks at execution time, continue-on-failure list
//! semantics, keyword matching and daily caps.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use wab_automation::{AutomationEngine, LoggingCrmBridge, TriggerEvent};
use wab_common::{MessagingTier, PlanTier, QualityRating};
use wab_engine::{EngineConfig, MessagingProvider, Platform};
use wab_limits::{MemoryBackoffTracker, MemoryKillSwitch, MemoryRateLimiter};
use wab_lock::MemoryExecutionLock;
use wab_provider::{
    MediaLink, PhoneCredentials, PhoneNumberInfo, SendResponse, SendResponseMessage,
    TemplateMessageRequest, TextMessageRequest,
};
use wab_queue::MemoryJobQueue;
use wab_store::{
    ActionStep, AutomationRule, AutomationRuleRepository, Contact, ContactRepository,
    Conversation, ConversationRepository, KeywordMatchMode, MessageStatus, PhoneStatus,
    RuleAction, RuleCondition, Store, Template, TemplateCategory, TemplateRepository,
    TemplateStatus, TriggerKind, Workspace, WorkspaceRepository,
};

#[derive(Default)]
struct CountingProvider {
    text_calls: AtomicU32,
    template_calls: AtomicU32,
    media_calls: AtomicU32,
}

impl CountingProvider {
    fn response(&self) -> SendResponse {
        SendResponse {
            messaging_product: "whatsapp".to_string(),
            contacts: Vec::new(),
            messages: vec![SendResponseMessage {
                id: format!(
                    "wamid.AUTO{}",
                    self.text_calls.load(Ordering::SeqCst)
                        + self.template_calls.load(Ordering::SeqCst)
                        + self.media_calls.load(Ordering::SeqCst)
                ),
            }],
        }
    }
}

#[async_trait]
impl MessagingProvider for CountingProvider {
    async fn send_template(
        &self,
        _creds: &PhoneCredentials,
        _request: &TemplateMessageRequest,
    ) -> wab_provider::Result<SendResponse> {
        self.template_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response())
    }

    async fn send_text(
        &self,
        _creds: &PhoneCredentials,
        _request: &TextMessageRequest,
    ) -> wab_provider::Result<SendResponse> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response())
    }

    async fn send_media(
        &self,
        _creds: &PhoneCredentials,
        _to: &str,
        _kind: &str,
        _media: MediaLink,
    ) -> wab_provider::Result<SendResponse> {
        self.media_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response())
    }

    async fn fetch_phone_number(
        &self,
        _creds: &PhoneCredentials,
    ) -> wab_provider::Result<PhoneNumberInfo> {
        unimplemented!("automation tests never fetch phone info")
    }
}

struct Harness {
    platform: Platform,
    engine: AutomationEngine,
    provider: Arc<CountingProvider>,
}

fn harness() -> Harness {
    let provider = Arc::new(CountingProvider::default());
    let platform = Platform {
        store: Store::memory(),
        lock: Arc::new(MemoryExecutionLock::new()),
        limiter: Arc::new(MemoryRateLimiter::new()),
        backoff: Arc::new(MemoryBackoffTracker::new()),
        kill_switch: Arc::new(MemoryKillSwitch::new()),
        provider: provider.clone(),
        queue: Arc::new(MemoryJobQueue::default()),
        config: Arc::new(EngineConfig::default()),
    };
    let engine = AutomationEngine::new(platform.clone(), Arc::new(LoggingCrmBridge));
    Harness {
        platform,
        engine,
        provider,
    }
}

impl Harness {
    async fn seed_workspace(&self) {
        let mut workspace = Workspace::new("t1", "Acme", PlanTier::Basic);
        workspace.credentials.access_token = Some("token".to_string());
        workspace.credentials.token_expires_at = Some(Utc::now() + ChronoDuration::days(60));
        workspace.credentials.phone_number_id = Some("phone-1".to_string());
        workspace.phone_status = PhoneStatus::Connected;
        workspace.quality_rating = QualityRating::Green;
        workspace.messaging_tier = MessagingTier::Tier1k;
        self.platform.store.workspaces.insert(&workspace).await.unwrap();
    }

    async fn seed_contact(&self) -> Contact {
        let contact = Contact::new("t1", "15557654321");
        self.platform.store.contacts.insert(&contact).await.unwrap();
        contact
    }

    /// Open conversation whose last customer message landed `hours_ago`.
    async fn seed_conversation(&self, contact_id: &str, hours_ago: i64) -> Conversation {
        let conversation = self
            .platform
            .store
            .conversations
            .ensure_open("t1", contact_id)
            .await
            .unwrap();
        self.platform
            .store
            .conversations
            .touch_customer_message(
                &conversation.id,
                Utc::now() - ChronoDuration::hours(hours_ago),
            )
            .await
            .unwrap();
        self.platform
            .store
            .conversations
            .find_by_id(&conversation.id)
            .await
            .unwrap()
            .unwrap()
    }

    async fn seed_rule(&self, rule: AutomationRule) -> AutomationRule {
        self.platform.store.automation_rules.insert(&rule).await.unwrap();
        rule
    }

    async fn rule(&self, id: &str) -> AutomationRule {
        self.platform
            .store
            .automation_rules
            .find_by_id("t1", id)
            .await
            .unwrap()
            .unwrap()
    }
}

fn message_event(contact: &Contact, conversation: &Conversation, text: &str) -> TriggerEvent {
    TriggerEvent::MessageReceived {
        contact_id: contact.id.clone(),
        conversation_id: conversation.id.clone(),
        text: Some(text.to_string()),
    }
}

#[tokio::test]
async fn session_text_outside_window_fails_with_no_24h_window() {
    let h = harness();
    h.seed_workspace().await;
    let contact = h.seed_contact().await;
    // Last customer message 25 hours ago: the window is closed.
    let conversation = h.seed_conversation(&contact.id, 25).await;

    let rule = h
        .seed_rule(AutomationRule::new(
            "t1",
            "follow-up",
            TriggerKind::MessageReceived,
            RuleCondition::Always,
            vec![ActionStep {
                action: RuleAction::SendTextMessage {
                    text: "thanks for reaching out".to_string(),
                },
                continue_on_failure: false,
            }],
        ))
        .await;

    h.engine
        .dispatch("t1", &message_event(&contact, &conversation, "hi"))
        .await;

    assert_eq!(h.provider.text_calls.load(Ordering::SeqCst), 0);
    let rule = h.rule(&rule.id).await;
    assert_eq!(rule.failure_count, 1);
    assert_eq!(rule.success_count, 0);
    assert!(rule.last_error.unwrap().contains("NO_24H_WINDOW"));
}

#[tokio::test]
async fn session_text_inside_window_sends() {
    let h = harness();
    h.seed_workspace().await;
    let contact = h.seed_contact().await;
    let conversation = h.seed_conversation(&contact.id, 1).await;

    let rule = h
        .seed_rule(AutomationRule::new(
            "t1",
            "follow-up",
            TriggerKind::MessageReceived,
            RuleCondition::Always,
            vec![ActionStep {
                action: RuleAction::SendTextMessage {
                    text: "thanks!".to_string(),
                },
                continue_on_failure: false,
            }],
        ))
        .await;

    h.engine
        .dispatch("t1", &message_event(&contact, &conversation, "hi"))
        .await;

    assert_eq!(h.provider.text_calls.load(Ordering::SeqCst), 1);
    let rule = h.rule(&rule.id).await;
    assert_eq!(rule.success_count, 1);
    assert_eq!(rule.failure_count, 0);
}

#[tokio::test]
async fn continue_on_failure_controls_list_abort() {
    let h = harness();
    h.seed_workspace().await;
    let contact = h.seed_contact().await;
    let conversation = h.seed_conversation(&contact.id, 25).await;

    // Aborting list: the failing send stops the tag from being applied.
    let aborting = h
        .seed_rule(AutomationRule::new(
            "t1",
            "abort-on-failure",
            TriggerKind::MessageReceived,
            RuleCondition::Always,
            vec![
                ActionStep {
                    action: RuleAction::SendTextMessage {
                        text: "hello".to_string(),
                    },
                    continue_on_failure: false,
                },
                ActionStep {
                    action: RuleAction::AddTag {
                        tag: "contacted".to_string(),
                    },
                    continue_on_failure: false,
                },
            ],
        ))
        .await;

    h.engine
        .dispatch("t1", &message_event(&contact, &conversation, "hi"))
        .await;

    let loaded = h
        .platform
        .store
        .contacts
        .find_by_id("t1", &contact.id)
        .await
        .unwrap()
        .unwrap();
    assert!(loaded.tags.is_empty(), "list must abort before AddTag");
    assert_eq!(h.rule(&aborting.id).await.failure_count, 1);

    // Tolerant list: the same failure is recorded but the tag still lands.
    h.platform
        .store
        .automation_rules
        .set_enabled("t1", &aborting.id, false)
        .await
        .unwrap();
    let tolerant = h
        .seed_rule(AutomationRule::new(
            "t1",
            "continue-on-failure",
            TriggerKind::MessageReceived,
            RuleCondition::Always,
            vec![
                ActionStep {
                    action: RuleAction::SendTextMessage {
                        text: "hello".to_string(),
                    },
                    continue_on_failure: true,
                },
                ActionStep {
                    action: RuleAction::AddTag {
                        tag: "contacted".to_string(),
                    },
                    continue_on_failure: false,
                },
            ],
        ))
        .await;

    h.engine
        .dispatch("t1", &message_event(&contact, &conversation, "hi"))
        .await;

    let loaded = h
        .platform
        .store
        .contacts
        .find_by_id("t1", &contact.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.tags, vec!["contacted".to_string()]);
    // The tolerated failure still counts the run as failed.
    assert_eq!(h.rule(&tolerant.id).await.failure_count, 1);
}

#[tokio::test]
async fn keyword_rules_match_per_mode() {
    let h = harness();
    h.seed_workspace().await;
    let contact = h.seed_contact().await;
    let conversation = h.seed_conversation(&contact.id, 1).await;

    let rule = h
        .seed_rule(AutomationRule::new(
            "t1",
            "opt-out",
            TriggerKind::Keyword,
            RuleCondition::Keyword {
                keywords: vec!["stop".to_string()],
                match_mode: KeywordMatchMode::Exact,
            },
            vec![ActionStep {
                action: RuleAction::AddTag {
                    tag: "opted-out".to_string(),
                },
                continue_on_failure: false,
            }],
        ))
        .await;

    // Non-matching text leaves the rule untouched.
    h.engine
        .dispatch("t1", &message_event(&contact, &conversation, "please stop"))
        .await;
    assert_eq!(h.rule(&rule.id).await.success_count, 0);

    h.engine
        .dispatch("t1", &message_event(&contact, &conversation, "STOP"))
        .await;
    assert_eq!(h.rule(&rule.id).await.success_count, 1);

    let loaded = h
        .platform
        .store
        .contacts
        .find_by_id("t1", &contact.id)
        .await
        .unwrap()
        .unwrap();
    assert!(loaded.tags.contains(&"opted-out".to_string()));
}

#[tokio::test]
async fn daily_cap_stops_further_executions() {
    let h = harness();
    h.seed_workspace().await;
    let contact = h.seed_contact().await;
    let conversation = h.seed_conversation(&contact.id, 1).await;

    let mut rule = AutomationRule::new(
        "t1",
        "capped",
        TriggerKind::MessageReceived,
        RuleCondition::Always,
        vec![ActionStep {
            action: RuleAction::AddNote {
                text: "seen".to_string(),
            },
            continue_on_failure: false,
        }],
    );
    rule.daily_cap = 1;
    let rule = h.seed_rule(rule).await;

    h.engine
        .dispatch("t1", &message_event(&contact, &conversation, "one"))
        .await;
    h.engine
        .dispatch("t1", &message_event(&contact, &conversation, "two"))
        .await;

    let loaded = h.rule(&rule.id).await;
    assert_eq!(loaded.success_count, 1);
    assert_eq!(loaded.executions_today, 1);

    let conversation = h
        .platform
        .store
        .conversations
        .find_by_id(&conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conversation.notes.len(), 1);
}

#[tokio::test]
async fn template_action_reverifies_approval_at_execution_time() {
    let h = harness();
    h.seed_workspace().await;
    let contact = h.seed_contact().await;
    let conversation = h.seed_conversation(&contact.id, 1).await;

    let now = Utc::now();
    let template = Template {
        id: "tpl-welcome".to_string(),
        tenant_id: "t1".to_string(),
        name: "welcome".to_string(),
        language: "en_US".to_string(),
        category: TemplateCategory::Marketing,
        status: TemplateStatus::Approved,
        header: None,
        body: "Welcome!".to_string(),
        footer: None,
        buttons: Vec::new(),
        provider_template_id: None,
        rejection_reason: None,
        created_at: now,
        updated_at: now,
    };
    h.platform.store.templates.insert(&template).await.unwrap();

    let rule = h
        .seed_rule(AutomationRule::new(
            "t1",
            "welcome",
            TriggerKind::MessageReceived,
            RuleCondition::Always,
            vec![ActionStep {
                action: RuleAction::SendTemplateMessage {
                    template_id: "tpl-welcome".to_string(),
                    body_variables: Vec::new(),
                },
                continue_on_failure: false,
            }],
        ))
        .await;

    // Approved at configuration time, paused at execution time.
    h.platform
        .store
        .templates
        .set_status("tpl-welcome", TemplateStatus::Paused, None)
        .await
        .unwrap();

    h.engine
        .dispatch("t1", &message_event(&contact, &conversation, "hi"))
        .await;

    assert_eq!(h.provider.template_calls.load(Ordering::SeqCst), 0);
    let rule = h.rule(&rule.id).await;
    assert_eq!(rule.failure_count, 1);
}

#[tokio::test]
async fn status_trigger_fires_on_matching_status() {
    let h = harness();
    h.seed_workspace().await;
    let contact = h.seed_contact().await;
    h.seed_conversation(&contact.id, 1).await;

    let rule = h
        .seed_rule(AutomationRule::new(
            "t1",
            "failed-alert",
            TriggerKind::StatusUpdated,
            RuleCondition::StatusIn {
                statuses: vec![MessageStatus::Failed],
            },
            vec![ActionStep {
                action: RuleAction::AddTag {
                    tag: "delivery-problem".to_string(),
                },
                continue_on_failure: false,
            }],
        ))
        .await;

    // Delivered does not match; failed does.
    h.engine
        .dispatch(
            "t1",
            &TriggerEvent::StatusUpdated {
                contact_id: Some(contact.id.clone()),
                status: MessageStatus::Delivered,
            },
        )
        .await;
    assert_eq!(h.rule(&rule.id).await.success_count, 0);

    h.engine
        .dispatch(
            "t1",
            &TriggerEvent::StatusUpdated {
                contact_id: Some(contact.id.clone()),
                status: MessageStatus::Failed,
            },
        )
        .await;
    assert_eq!(h.rule(&rule.id).await.success_count, 1);
}

#[tokio::test]
async fn assignment_round_robin_rotates_and_least_busy_picks_idle_agent() {
    let h = harness();
    h.seed_workspace().await;
    let contact = h.seed_contact().await;
    let conversation = h.seed_conversation(&contact.id, 1).await;

    let rule = h
        .seed_rule(AutomationRule::new(
            "t1",
            "route",
            TriggerKind::MessageReceived,
            RuleCondition::Always,
            vec![ActionStep {
                action: RuleAction::AssignConversation {
                    strategy: wab_store::AssignStrategy::RoundRobin,
                    agents: vec!["agent-a".to_string(), "agent-b".to_string()],
                },
                continue_on_failure: false,
            }],
        ))
        .await;

    h.engine
        .dispatch("t1", &message_event(&contact, &conversation, "hi"))
        .await;
    let first = h
        .platform
        .store
        .conversations
        .find_by_id(&conversation.id)
        .await
        .unwrap()
        .unwrap()
        .assignee
        .unwrap();

    h.engine
        .dispatch("t1", &message_event(&contact, &conversation, "again"))
        .await;
    let second = h
        .platform
        .store
        .conversations
        .find_by_id(&conversation.id)
        .await
        .unwrap()
        .unwrap()
        .assignee
        .unwrap();

    assert_ne!(first, second, "round robin must rotate agents");
    assert_eq!(h.rule(&rule.id).await.success_count, 2);
}
