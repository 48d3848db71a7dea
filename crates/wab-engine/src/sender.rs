//! Template Send Pipeline
//!
//! The single-send path: validate template approval and variable arity,
//! verify tenant eligibility, build the provider payload, emit, and persist
//! the outbound message in one write. Exactly one of two outcomes per call:
//! a durable Message row with the provider id, or a classified error with
//! no charged send.
//!
//! Idempotency: when campaign attribution is present and a CampaignMessage
//! for (campaign, contact) is already sent/delivered/read, the call skips
//! the provider entirely and returns the existing id.

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::{MessagingProvider, Platform};
use wab_provider::{
    normalize_phone, ButtonSubType, Component, Parameter, PhoneCredentials,
    TemplateMessageRequest,
};
use wab_store::{
    Attribution, ButtonKind, CampaignMessageRepository, ConversationLedgerEntry,
    ConversationRepository, HeaderFormat, Message, MessageKind, MessageRepository, Template,
    TemplateRepository, WorkspaceRepository,
};

/// How the caller identifies the template.
#[derive(Debug, Clone)]
pub enum TemplateRef {
    Id(String),
    Name { name: String, language: Option<String> },
}

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub tenant_id: String,
    pub template: TemplateRef,
    pub to: String,
    pub header_variables: Vec<String>,
    pub body_variables: Vec<String>,
    /// Per-button parameter lists, index-aligned with the template buttons.
    pub button_variables: Vec<Vec<String>>,
    pub contact_id: Option<String>,
    pub attribution: Option<Attribution>,
}

impl SendRequest {
    pub fn new(
        tenant_id: impl Into<String>,
        template: TemplateRef,
        to: impl Into<String>,
        body_variables: Vec<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            template,
            to: to.into(),
            header_variables: Vec::new(),
            body_variables,
            button_variables: Vec::new(),
            contact_id: None,
            attribution: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message_id: Option<String>,
    pub provider_message_id: String,
    /// True when the idempotency guard short-circuited the provider call.
    pub deduplicated: bool,
}

pub struct TemplateSender {
    platform: Platform,
}

impl TemplateSender {
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }

    async fn load_template(&self, tenant_id: &str, reference: &TemplateRef) -> Result<Template> {
        match reference {
            TemplateRef::Id(id) => {
                match self.platform.store.templates.find_any_by_id(id).await? {
                    None => Err(EngineError::TemplateNotFound(id.clone())),
                    Some(template) if template.tenant_id != tenant_id => {
                        Err(EngineError::TemplateOwnershipMismatch {
                            template_id: id.clone(),
                            tenant_id: tenant_id.to_string(),
                        })
                    }
                    Some(template) => Ok(template),
                }
            }
            TemplateRef::Name { name, language } => self
                .platform
                .store
                .templates
                .find_by_name(tenant_id, name, language.as_deref())
                .await?
                .ok_or_else(|| EngineError::TemplateNotFound(name.clone())),
        }
    }

    fn validate_arity(template: &Template, request: &SendRequest) -> Result<()> {
        let expected = template.body_variable_count();
        let actual = request.body_variables.len() as u32;
        if expected != actual {
            return Err(EngineError::VariableCountMismatch {
                region: "body",
                expected,
                actual,
            });
        }

        let expected = template.header_variable_count();
        let actual = request.header_variables.len() as u32;
        if expected != actual {
            return Err(EngineError::VariableCountMismatch {
                region: "header",
                expected,
                actual,
            });
        }

        let expected_counts = template.button_variable_counts();
        for (index, expected) in expected_counts.iter().enumerate() {
            let actual = request
                .button_variables
                .get(index)
                .map(|v| v.len() as u32)
                .unwrap_or(0);
            if *expected != actual {
                return Err(EngineError::VariableCountMismatch {
                    region: "buttons",
                    expected: *expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    fn build_request(
        template: &Template,
        to: &str,
        request: &SendRequest,
    ) -> TemplateMessageRequest {
        let mut message =
            TemplateMessageRequest::new(to, template.name.clone(), template.language.clone());

        if let Some(header) = &template.header {
            let parameters = match header.format {
                HeaderFormat::Text => request
                    .header_variables
                    .iter()
                    .map(|v| Parameter::text(v.clone()))
                    .collect::<Vec<_>>(),
                HeaderFormat::Image => request
                    .header_variables
                    .first()
                    .map(|link| {
                        vec![Parameter::Image {
                            image: wab_provider::MediaLink::new(link.clone()),
                        }]
                    })
                    .unwrap_or_default(),
                HeaderFormat::Video => request
                    .header_variables
                    .first()
                    .map(|link| {
                        vec![Parameter::Video {
                            video: wab_provider::MediaLink::new(link.clone()),
                        }]
                    })
                    .unwrap_or_default(),
                HeaderFormat::Document => request
                    .header_variables
                    .first()
                    .map(|link| {
                        vec![Parameter::Document {
                            document: wab_provider::MediaLink::new(link.clone()),
                        }]
                    })
                    .unwrap_or_default(),
            };
            if !parameters.is_empty() {
                message = message.with_component(Component::header(parameters));
            }
        }

        if !request.body_variables.is_empty() {
            message = message.with_component(Component::body(
                request
                    .body_variables
                    .iter()
                    .map(|v| Parameter::text(v.clone()))
                    .collect(),
            ));
        }

        for (index, button) in template.buttons.iter().enumerate() {
            let Some(values) = request.button_variables.get(index) else {
                continue;
            };
            if values.is_empty() {
                continue;
            }
            let (sub_type, parameters) = match button.kind {
                ButtonKind::Url => (
                    ButtonSubType::Url,
                    values.iter().map(|v| Parameter::text(v.clone())).collect(),
                ),
                ButtonKind::QuickReply => (
                    ButtonSubType::QuickReply,
                    values
                        .iter()
                        .map(|v| Parameter::Payload { payload: v.clone() })
                        .collect(),
                ),
            };
            message = message.with_component(Component::button(sub_type, index as u32, parameters));
        }

        message
    }

    /// Send a single template message. See module docs for the contract.
    pub async fn send(&self, request: &SendRequest) -> Result<SendOutcome> {
        // Idempotency guard for campaign sends.
        if let (Some(attribution), Some(contact_id)) = (&request.attribution, &request.contact_id)
        {
            if let Some(existing) = self
                .platform
                .store
                .campaign_messages
                .find(&attribution.campaign_id, contact_id)
                .await?
            {
                if existing.already_emitted() {
                    debug!(
                        campaign_id = %attribution.campaign_id,
                        contact_id = %contact_id,
                        "Send skipped: recipient already emitted"
                    );
                    return Ok(SendOutcome {
                        message_id: None,
                        provider_message_id: existing
                            .provider_message_id
                            .unwrap_or_default(),
                        deduplicated: true,
                    });
                }
            }
        }

        let template = self.load_template(&request.tenant_id, &request.template).await?;
        if !template.is_sendable() {
            return Err(EngineError::TemplateNotApproved(template.name.clone()));
        }

        Self::validate_arity(&template, request)?;

        let workspace = self
            .platform
            .store
            .workspaces
            .find_by_id(&request.tenant_id)
            .await?
            .ok_or_else(|| EngineError::WorkspaceNotFound(request.tenant_id.clone()))?;

        let now = Utc::now();
        if !workspace.is_bsp_connected(now) {
            return Err(EngineError::WorkspaceNotConfigured(request.tenant_id.clone()));
        }
        let credentials = PhoneCredentials {
            access_token: workspace
                .credentials
                .access_token
                .clone()
                .ok_or_else(|| EngineError::WorkspaceNotConfigured(request.tenant_id.clone()))?,
            phone_number_id: workspace
                .credentials
                .phone_number_id
                .clone()
                .ok_or_else(|| EngineError::PhoneNotConfigured(request.tenant_id.clone()))?,
        };

        let to = normalize_phone(&request.to)
            .map_err(|_| EngineError::InvalidRecipient(request.to.clone()))?;

        let payload = Self::build_request(&template, &to, request);
        let response = self.platform.provider.send_template(&credentials, &payload).await?;
        let provider_message_id = response
            .provider_message_id()
            .ok_or_else(|| {
                EngineError::Provider(wab_provider::ProviderError::Decode(
                    "send response carried no message id".to_string(),
                ))
            })?
            .to_string();

        let rendered = crate::variables::render_body(&template.body, &request.body_variables);
        let message = Message::outbound_sent(
            &request.tenant_id,
            request.contact_id.clone(),
            &to,
            MessageKind::Template,
            Some(rendered),
            &provider_message_id,
            request.attribution.clone(),
        );
        self.platform.store.messages.insert(&message).await?;

        self.platform
            .store
            .workspaces
            .increment_usage(&request.tenant_id, 1, now)
            .await?;

        // Ledger entry: template sends open (or would open) a
        // business-initiated billing session.
        if let Some(contact_id) = &request.contact_id {
            if let Some(conversation) = self
                .platform
                .store
                .conversations
                .find_for_contact(&request.tenant_id, contact_id)
                .await?
            {
                if !conversation.within_session_window(now) {
                    let entry = ConversationLedgerEntry::business_initiated(
                        &conversation,
                        request.attribution.as_ref().map(|a| a.campaign_id.clone()),
                        Some(template.id.clone()),
                        true,
                    );
                    self.platform
                        .store
                        .conversations
                        .insert_ledger_entry(&entry)
                        .await?;
                }
            }
        }

        metrics::counter!("wab_sends_total").increment(1);
        info!(
            tenant_id = %request.tenant_id,
            template = %template.name,
            provider_message_id = %provider_message_id,
            "Template message sent"
        );

        Ok(SendOutcome {
            message_id: Some(message.id),
            provider_message_id,
            deduplicated: false,
        })
    }

    /// Compute the rendered body and the exact provider payload without
    /// sending anything. Backs the send-preview surface.
    pub async fn preview(
        &self,
        request: &SendRequest,
    ) -> Result<(String, TemplateMessageRequest)> {
        let template = self.load_template(&request.tenant_id, &request.template).await?;
        Self::validate_arity(&template, request)?;
        let to = normalize_phone(&request.to)
            .map_err(|_| EngineError::InvalidRecipient(request.to.clone()))?;
        let rendered = crate::variables::render_body(&template.body, &request.body_variables);
        Ok((rendered, Self::build_request(&template, &to, request)))
    }

    /// Bulk fan-out with a hard cap; each recipient is an independent
    /// single send so failures never abort the rest.
    pub async fn send_bulk(&self, requests: Vec<SendRequest>) -> Result<Vec<Result<SendOutcome>>> {
        if requests.len() > self.platform.config.bulk_send_cap {
            return Err(EngineError::InvalidRecipient(format!(
                "bulk send of {} exceeds the cap of {}",
                requests.len(),
                self.platform.config.bulk_send_cap
            )));
        }

        let mut outcomes = Vec::with_capacity(requests.len());
        for request in &requests {
            outcomes.push(self.send(request).await);
            tokio::time::sleep(self.platform.config.inter_message_pause).await;
        }
        Ok(outcomes)
    }
}
