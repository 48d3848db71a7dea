//! Automation Action Executor
//!
//! Runs one action against the platform. Session messages (text/media) are
//! gated on the 24-hour anchor before touching the provider; template
//! sends go through the send pipeline which re-verifies approval.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::CrmBridge;
use wab_engine::{MessagingProvider, Platform, SendRequest, TemplateRef, TemplateSender};
use wab_provider::{MediaLink, PhoneCredentials, TextMessageRequest};
use wab_store::{
    AssignStrategy, Contact, ContactRepository, Conversation, ConversationNote,
    ConversationRepository, ConversationStatus, MediaKind, Message, MessageKind,
    MessageRepository, RuleAction, WorkspaceRepository, MAX_INLINE_DELAY_SECONDS,
};

#[derive(Error, Debug)]
pub enum ActionError {
    /// Session window closed; wire-stable name for rule diagnostics.
    #[error("NO_24H_WINDOW: last customer message is older than 24 hours")]
    No24hWindow,

    #[error("no contact in scope for this action")]
    NoContact,

    #[error("no conversation in scope for this action")]
    NoConversation,

    #[error("no agents configured for assignment")]
    NoAgents,

    #[error("{0}")]
    Engine(#[from] wab_engine::EngineError),

    #[error("{0}")]
    Store(#[from] wab_store::StoreError),

    #[error("webhook call failed: {0}")]
    Webhook(String),

    #[error("CRM bridge error: {0}")]
    Crm(String),
}

pub type ActionOutcome = Result<(), ActionError>;

#[derive(Debug, Clone)]
pub struct ActionContext {
    pub tenant_id: String,
    pub rule_id: String,
    pub contact_id: Option<String>,
    pub conversation_id: Option<String>,
}

pub struct ActionExecutor {
    platform: Platform,
    sender: TemplateSender,
    crm: Arc<dyn CrmBridge>,
    http: reqwest::Client,
    /// Rotation cursors for round-robin assignment, per rule.
    round_robin: DashMap<String, AtomicUsize>,
}

impl ActionExecutor {
    pub fn new(platform: Platform, sender: TemplateSender, crm: Arc<dyn CrmBridge>) -> Self {
        Self {
            platform,
            sender,
            crm,
            http: reqwest::Client::new(),
            round_robin: DashMap::new(),
        }
    }

    async fn contact(&self, context: &ActionContext) -> Result<Contact, ActionError> {
        let contact_id = context.contact_id.as_deref().ok_or(ActionError::NoContact)?;
        self.platform
            .store
            .contacts
            .find_by_id(&context.tenant_id, contact_id)
            .await?
            .ok_or(ActionError::NoContact)
    }

    async fn conversation(&self, context: &ActionContext) -> Result<Conversation, ActionError> {
        if let Some(id) = context.conversation_id.as_deref() {
            if let Some(conversation) = self.platform.store.conversations.find_by_id(id).await? {
                return Ok(conversation);
            }
        }
        if let Some(contact_id) = context.contact_id.as_deref() {
            if let Some(conversation) = self
                .platform
                .store
                .conversations
                .find_for_contact(&context.tenant_id, contact_id)
                .await?
            {
                return Ok(conversation);
            }
        }
        Err(ActionError::NoConversation)
    }

    /// The 24-hour gate for session-window-only message kinds. Always
    /// anchor arithmetic against the stored timestamp, never a timer.
    async fn guard_session_window(
        &self,
        context: &ActionContext,
    ) -> Result<Conversation, ActionError> {
        let conversation = self.conversation(context).await?;
        if !conversation.within_session_window(Utc::now()) {
            return Err(ActionError::No24hWindow);
        }
        Ok(conversation)
    }

    async fn credentials(&self, tenant_id: &str) -> Result<PhoneCredentials, ActionError> {
        let workspace = self
            .platform
            .store
            .workspaces
            .find_by_id(tenant_id)
            .await?
            .ok_or_else(|| {
                ActionError::Engine(wab_engine::EngineError::WorkspaceNotFound(
                    tenant_id.to_string(),
                ))
            })?;
        match (
            workspace.credentials.access_token,
            workspace.credentials.phone_number_id,
        ) {
            (Some(access_token), Some(phone_number_id)) => Ok(PhoneCredentials {
                access_token,
                phone_number_id,
            }),
            _ => Err(ActionError::Engine(
                wab_engine::EngineError::WorkspaceNotConfigured(tenant_id.to_string()),
            )),
        }
    }

    pub async fn execute(&self, context: &ActionContext, action: &RuleAction) -> ActionOutcome {
        debug!(rule_id = %context.rule_id, action = ?action, "Executing automation action");
        match action {
            RuleAction::SendTemplateMessage {
                template_id,
                body_variables,
            } => {
                let contact = self.contact(context).await?;
                // Approval is re-verified inside the pipeline at execution
                // time, not only at rule-configuration time.
                self.sender
                    .send(&SendRequest {
                        tenant_id: context.tenant_id.clone(),
                        template: TemplateRef::Id(template_id.clone()),
                        to: contact.phone.clone(),
                        header_variables: Vec::new(),
                        body_variables: body_variables.clone(),
                        button_variables: Vec::new(),
                        contact_id: Some(contact.id.clone()),
                        attribution: None,
                    })
                    .await?;
                Ok(())
            }

            RuleAction::SendTextMessage { text } => {
                let conversation = self.guard_session_window(context).await?;
                let contact = self.contact(context).await?;
                let credentials = self.credentials(&context.tenant_id).await?;

                let request = TextMessageRequest::new(contact.phone.clone(), text.clone());
                let response = self
                    .platform
                    .provider
                    .send_text(&credentials, &request)
                    .await
                    .map_err(wab_engine::EngineError::Provider)?;

                let mut message = Message::outbound_sent(
                    &context.tenant_id,
                    Some(contact.id.clone()),
                    &contact.phone,
                    MessageKind::Text,
                    Some(text.clone()),
                    response.provider_message_id().unwrap_or_default(),
                    None,
                );
                message.conversation_id = Some(conversation.id.clone());
                self.platform.store.messages.insert(&message).await?;
                Ok(())
            }

            RuleAction::SendMediaMessage {
                media,
                url,
                caption,
            } => {
                let conversation = self.guard_session_window(context).await?;
                let contact = self.contact(context).await?;
                let credentials = self.credentials(&context.tenant_id).await?;

                let (kind_str, kind) = match media {
                    MediaKind::Image => ("image", MessageKind::Image),
                    MediaKind::Video => ("video", MessageKind::Video),
                    MediaKind::Document => ("document", MessageKind::Document),
                    MediaKind::Audio => ("audio", MessageKind::Audio),
                };
                let mut link = MediaLink::new(url.clone());
                link.caption = caption.clone();
                let response = self
                    .platform
                    .provider
                    .send_media(&credentials, &contact.phone, kind_str, link)
                    .await
                    .map_err(wab_engine::EngineError::Provider)?;

                let mut message = Message::outbound_sent(
                    &context.tenant_id,
                    Some(contact.id.clone()),
                    &contact.phone,
                    kind,
                    caption.clone(),
                    response.provider_message_id().unwrap_or_default(),
                    None,
                );
                message.conversation_id = Some(conversation.id.clone());
                message.media_url = Some(url.clone());
                self.platform.store.messages.insert(&message).await?;
                Ok(())
            }

            RuleAction::AssignConversation { strategy, agents } => {
                let conversation = self.conversation(context).await?;
                let assignee = self
                    .pick_assignee(&context.tenant_id, &context.rule_id, *strategy, agents)
                    .await?;
                self.platform
                    .store
                    .conversations
                    .set_assignee(&conversation.id, Some(assignee))
                    .await?;
                Ok(())
            }

            RuleAction::AddTag { tag } => {
                let contact = self.contact(context).await?;
                self.platform
                    .store
                    .contacts
                    .add_tag(&context.tenant_id, &contact.id, tag)
                    .await?;
                Ok(())
            }

            RuleAction::RemoveTag { tag } => {
                let contact = self.contact(context).await?;
                self.platform
                    .store
                    .contacts
                    .remove_tag(&context.tenant_id, &contact.id, tag)
                    .await?;
                Ok(())
            }

            RuleAction::MovePipelineStage {
                pipeline_id,
                stage_id,
            } => {
                let contact = self.contact(context).await?;
                self.crm
                    .move_pipeline_stage(&context.tenant_id, &contact.id, pipeline_id, stage_id)
                    .await
                    .map_err(ActionError::Crm)
            }

            RuleAction::CreateDeal { name, pipeline_id } => {
                let contact = self.contact(context).await?;
                self.crm
                    .create_deal(&context.tenant_id, &contact.id, name, pipeline_id)
                    .await
                    .map_err(ActionError::Crm)
            }

            RuleAction::NotifyAgent { agent_id, message } => self
                .crm
                .notify_agent(&context.tenant_id, agent_id, message)
                .await
                .map_err(ActionError::Crm),

            RuleAction::NotifyWebhook { url } => {
                let payload = serde_json::json!({
                    "tenantId": context.tenant_id,
                    "ruleId": context.rule_id,
                    "contactId": context.contact_id,
                    "conversationId": context.conversation_id,
                });
                let response = self
                    .http
                    .post(url)
                    .json(&payload)
                    .timeout(Duration::from_secs(10))
                    .send()
                    .await
                    .map_err(|e| ActionError::Webhook(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(ActionError::Webhook(format!(
                        "HTTP {}",
                        response.status()
                    )));
                }
                Ok(())
            }

            RuleAction::UpdateContact { field, value } => {
                let mut contact = self.contact(context).await?;
                match field.as_str() {
                    "name" => contact.name = Some(value.clone()),
                    "email" => contact.email = Some(value.clone()),
                    other => {
                        contact.metadata.insert(other.to_string(), value.clone());
                    }
                }
                contact.updated_at = Utc::now();
                self.platform.store.contacts.update(&contact).await?;
                Ok(())
            }

            RuleAction::AddNote { text } => {
                let conversation = self.conversation(context).await?;
                self.platform
                    .store
                    .conversations
                    .add_note(
                        &conversation.id,
                        ConversationNote {
                            text: text.clone(),
                            author: format!("rule:{}", context.rule_id),
                            at: Utc::now(),
                        },
                    )
                    .await?;
                Ok(())
            }

            RuleAction::Delay { seconds } => {
                let bounded = (*seconds).min(MAX_INLINE_DELAY_SECONDS);
                tokio::time::sleep(Duration::from_secs(bounded)).await;
                Ok(())
            }

            RuleAction::CloseConversation => {
                let conversation = self.conversation(context).await?;
                self.platform
                    .store
                    .conversations
                    .set_status(&conversation.id, ConversationStatus::Closed)
                    .await?;
                Ok(())
            }

            RuleAction::MarkAsResolved => {
                let conversation = self.conversation(context).await?;
                self.platform
                    .store
                    .conversations
                    .set_status(&conversation.id, ConversationStatus::Resolved)
                    .await?;
                Ok(())
            }
        }
    }

    async fn pick_assignee(
        &self,
        tenant_id: &str,
        rule_id: &str,
        strategy: AssignStrategy,
        agents: &[String],
    ) -> Result<String, ActionError> {
        if agents.is_empty() {
            return Err(ActionError::NoAgents);
        }
        match strategy {
            AssignStrategy::Specific => Ok(agents[0].clone()),
            AssignStrategy::RoundRobin => {
                let cursor = self
                    .round_robin
                    .entry(rule_id.to_string())
                    .or_insert_with(|| AtomicUsize::new(0));
                let index = cursor.fetch_add(1, Ordering::Relaxed) % agents.len();
                Ok(agents[index].clone())
            }
            AssignStrategy::LeastBusy => {
                let mut best = agents[0].clone();
                let mut best_count = u64::MAX;
                for agent in agents {
                    let count = self
                        .platform
                        .store
                        .conversations
                        .count_open_by_assignee(tenant_id, agent)
                        .await?;
                    if count < best_count {
                        best_count = count;
                        best = agent.clone();
                    }
                }
                Ok(best)
            }
        }
    }
}
