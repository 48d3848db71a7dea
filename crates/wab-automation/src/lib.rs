//! WaBridge Automation Engine
//!
//! Evaluates tenant rules against inbound events and status transitions and
//! executes their action lists. Hard rules enforced here:
//! - session-window-only actions (text/media sends) verify
//!   `now - lastCustomerMessageAt < 24h` against the stored anchor
//! - template-sending actions re-verify APPROVED at execution time
//! - per-rule daily caps gate execution; success/failure counters persist
//!
//! CRM-facing actions (deals, pipelines, agent notifications) cross into an
//! external collaborator and go through the [`CrmBridge`] seam.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod actions;

pub use actions::{ActionError, ActionOutcome};

use wab_engine::{Platform, TemplateSender};
use wab_store::{AutomationRule, AutomationRuleRepository, MessageStatus, TriggerKind};

/// An event fanned out to the automation engine by the ingester or the
/// campaign engine.
#[derive(Debug, Clone)]
pub enum TriggerEvent {
    MessageReceived {
        contact_id: String,
        conversation_id: String,
        text: Option<String>,
    },
    StatusUpdated {
        contact_id: Option<String>,
        status: MessageStatus,
    },
    CampaignCompleted {
        campaign_id: String,
    },
    TagAdded {
        contact_id: String,
        tag: String,
    },
    AdLead {
        contact_id: String,
        conversation_id: String,
        source_id: Option<String>,
    },
}

impl TriggerEvent {
    /// Rule trigger kinds this event can fire. Inbound messages feed both
    /// the message-received and keyword surfaces.
    fn trigger_kinds(&self) -> &'static [TriggerKind] {
        match self {
            TriggerEvent::MessageReceived { .. } => {
                &[TriggerKind::MessageReceived, TriggerKind::Keyword]
            }
            TriggerEvent::StatusUpdated { .. } => &[TriggerKind::StatusUpdated],
            TriggerEvent::CampaignCompleted { .. } => &[TriggerKind::CampaignCompleted],
            TriggerEvent::TagAdded { .. } => &[TriggerKind::TagAdded],
            TriggerEvent::AdLead { .. } => &[TriggerKind::AdLead],
        }
    }

    fn contact_id(&self) -> Option<&str> {
        match self {
            TriggerEvent::MessageReceived { contact_id, .. }
            | TriggerEvent::TagAdded { contact_id, .. }
            | TriggerEvent::AdLead { contact_id, .. } => Some(contact_id),
            TriggerEvent::StatusUpdated { contact_id, .. } => contact_id.as_deref(),
            TriggerEvent::CampaignCompleted { .. } => None,
        }
    }

    fn conversation_id(&self) -> Option<&str> {
        match self {
            TriggerEvent::MessageReceived {
                conversation_id, ..
            }
            | TriggerEvent::AdLead {
                conversation_id, ..
            } => Some(conversation_id),
            _ => None,
        }
    }

    fn matches(&self, rule: &AutomationRule) -> bool {
        match self {
            TriggerEvent::MessageReceived { text, .. } => match &rule.condition {
                wab_store::RuleCondition::Always => true,
                wab_store::RuleCondition::Keyword { .. } => text
                    .as_deref()
                    .map(|t| rule.condition.matches_keyword(t))
                    .unwrap_or(false),
                _ => false,
            },
            TriggerEvent::StatusUpdated { status, .. } => rule.condition.matches_status(*status),
            TriggerEvent::TagAdded { tag, .. } => rule.condition.matches_tag(tag),
            TriggerEvent::CampaignCompleted { .. } | TriggerEvent::AdLead { .. } => {
                matches!(rule.condition, wab_store::RuleCondition::Always)
            }
        }
    }
}

/// Seam to the external CRM subsystem. The core only hands events across;
/// deal/pipeline state lives elsewhere.
#[async_trait]
pub trait CrmBridge: Send + Sync {
    async fn move_pipeline_stage(
        &self,
        tenant_id: &str,
        contact_id: &str,
        pipeline_id: &str,
        stage_id: &str,
    ) -> Result<(), String>;

    async fn create_deal(
        &self,
        tenant_id: &str,
        contact_id: &str,
        name: &str,
        pipeline_id: &str,
    ) -> Result<(), String>;

    async fn notify_agent(&self, tenant_id: &str, agent_id: &str, message: &str)
        -> Result<(), String>;
}

/// Default bridge for deployments without a CRM attachment: log and accept.
pub struct LoggingCrmBridge;

#[async_trait]
impl CrmBridge for LoggingCrmBridge {
    async fn move_pipeline_stage(
        &self,
        tenant_id: &str,
        contact_id: &str,
        pipeline_id: &str,
        stage_id: &str,
    ) -> Result<(), String> {
        info!(
            tenant_id = %tenant_id,
            contact_id = %contact_id,
            pipeline_id = %pipeline_id,
            stage_id = %stage_id,
            "CRM bridge: move pipeline stage"
        );
        Ok(())
    }

    async fn create_deal(
        &self,
        tenant_id: &str,
        contact_id: &str,
        name: &str,
        pipeline_id: &str,
    ) -> Result<(), String> {
        info!(
            tenant_id = %tenant_id,
            contact_id = %contact_id,
            deal = %name,
            pipeline_id = %pipeline_id,
            "CRM bridge: create deal"
        );
        Ok(())
    }

    async fn notify_agent(
        &self,
        tenant_id: &str,
        agent_id: &str,
        message: &str,
    ) -> Result<(), String> {
        info!(tenant_id = %tenant_id, agent_id = %agent_id, message = %message, "CRM bridge: notify agent");
        Ok(())
    }
}

pub struct AutomationEngine {
    executor: actions::ActionExecutor,
    platform: Platform,
}

impl AutomationEngine {
    pub fn new(platform: Platform, crm: Arc<dyn CrmBridge>) -> Self {
        let sender = TemplateSender::new(platform.clone());
        Self {
            executor: actions::ActionExecutor::new(platform.clone(), sender, crm),
            platform,
        }
    }

    /// Evaluate every enabled rule matching the event and run the matching
    /// ones. Failures are recorded per rule and never propagate to the
    /// caller.
    pub async fn dispatch(&self, tenant_id: &str, event: &TriggerEvent) {
        for trigger in event.trigger_kinds() {
            let rules = match self
                .platform
                .store
                .automation_rules
                .list_enabled_by_trigger(tenant_id, *trigger)
                .await
            {
                Ok(rules) => rules,
                Err(e) => {
                    warn!(tenant_id = %tenant_id, trigger = ?trigger, error = %e, "Rule lookup failed");
                    continue;
                }
            };

            for rule in rules {
                if !event.matches(&rule) {
                    continue;
                }
                let now = Utc::now();
                if !rule.under_daily_cap(now) {
                    debug!(rule_id = %rule.id, "Rule skipped: daily cap reached");
                    continue;
                }

                let result = self.run_rule(tenant_id, &rule, event).await;
                let (success, error) = match &result {
                    Ok(()) => (true, None),
                    Err(e) => (false, Some(e.clone())),
                };
                metrics::counter!("wab_automation_executions_total").increment(1);
                if let Err(e) = self
                    .platform
                    .store
                    .automation_rules
                    .record_execution(&rule.id, success, error, now)
                    .await
                {
                    warn!(rule_id = %rule.id, error = %e, "Failed to record rule execution");
                }
            }
        }
    }

    async fn run_rule(
        &self,
        tenant_id: &str,
        rule: &AutomationRule,
        event: &TriggerEvent,
    ) -> Result<(), String> {
        debug!(rule_id = %rule.id, rule = %rule.name, "Running automation rule");
        let context = actions::ActionContext {
            tenant_id: tenant_id.to_string(),
            rule_id: rule.id.clone(),
            contact_id: event.contact_id().map(str::to_string),
            conversation_id: event.conversation_id().map(str::to_string),
        };

        let mut last_error: Option<String> = None;
        for (index, step) in rule.actions.iter().enumerate() {
            match self.executor.execute(&context, &step.action).await {
                Ok(()) => {}
                Err(e) => {
                    warn!(
                        rule_id = %rule.id,
                        step = index,
                        error = %e,
                        continue_on_failure = step.continue_on_failure,
                        "Automation action failed"
                    );
                    last_error = Some(e.to_string());
                    if !step.continue_on_failure {
                        return Err(e.to_string());
                    }
                }
            }
        }

        match last_error {
            // A tolerated failure still marks the run as failed for the
            // rule's counters.
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
