//! Webhook Ingester & Rollup
//!
//! Translates provider callbacks into monotonic per-message state
//! progressions and atomic per-campaign counter rollups. Processing errors
//! never propagate to the provider: the HTTP layer acknowledges 2xx and a
//! metric counts the failure.
//!
//! Exactly-once rollup: the counter delta for a status event is applied
//! only when the guarded message advance wins, so redelivered or racing
//! webhooks cannot double count.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::router::TenantRouter;
use wab_automation::{AutomationEngine, TriggerEvent};
use wab_common::{MessagingTier, QualityRating};
use wab_engine::{CampaignService, Platform, Result};
use wab_provider::{
    ChangeValue, InboundMessage, StatusEvent, WebhookEnvelope, FIELD_ACCOUNT, FIELD_MESSAGES,
    FIELD_QUALITY, FIELD_TEMPLATE_STATUS,
};
use wab_store::{
    advance_plan, CampaignMessageRepository, CampaignRepository, CampaignStatus,
    ContactRepository, ConversationRepository, Message, MessageKind, MessageRepository,
    MessageStatus, PauseReason, TemplateRepository, TemplateStatus, TotalsDelta,
    WebhookLog, WebhookLogRepository, WebhookOutcome, WorkspaceRepository,
};

pub struct WebhookIngester {
    platform: Platform,
    router: Arc<TenantRouter>,
    service: Arc<CampaignService>,
    automation: Arc<AutomationEngine>,
}

impl WebhookIngester {
    pub fn new(
        platform: Platform,
        router: Arc<TenantRouter>,
        service: Arc<CampaignService>,
        automation: Arc<AutomationEngine>,
    ) -> Self {
        Self {
            platform,
            router,
            service,
            automation,
        }
    }

    /// Process one provider envelope. Always succeeds from the caller's
    /// point of view; per-change failures are logged and counted.
    pub async fn process(&self, envelope: &WebhookEnvelope) {
        for entry in &envelope.entry {
            for change in &entry.changes {
                let log = WebhookLog::received(
                    change.field.clone(),
                    serde_json::to_value(&change.value).unwrap_or_default(),
                );
                if let Err(e) = self.platform.store.webhook_logs.insert(&log).await {
                    warn!(error = %e, "Failed to append webhook log");
                }

                let result = match change.field.as_str() {
                    FIELD_MESSAGES => self.process_messages_change(&change.value).await,
                    FIELD_TEMPLATE_STATUS => {
                        self.process_template_status(&entry.id, &change.value).await
                    }
                    FIELD_QUALITY => self.process_quality_update(&entry.id, &change.value).await,
                    FIELD_ACCOUNT => self.process_account_update(&entry.id, &change.value).await,
                    other => {
                        debug!(field = %other, "Ignoring unhandled webhook field");
                        Ok(None)
                    }
                };

                let (outcome, tenant_id, error) = match result {
                    Ok(tenant_id) => (WebhookOutcome::Processed, tenant_id, None),
                    Err(e) => {
                        metrics::counter!("wab_webhook_errors_total").increment(1);
                        warn!(field = %change.field, error = %e, "Webhook processing failed");
                        (WebhookOutcome::Failed, None, Some(e.to_string()))
                    }
                };
                if let Err(e) = self
                    .platform
                    .store
                    .webhook_logs
                    .set_outcome(&log.id, tenant_id, outcome, error)
                    .await
                {
                    warn!(error = %e, "Failed to update webhook log");
                }
            }
        }
    }

    async fn process_messages_change(&self, value: &ChangeValue) -> Result<Option<String>> {
        let Some(metadata) = &value.metadata else {
            debug!("Messages change without metadata; skipping");
            return Ok(None);
        };
        let Some(tenant_id) = self.router.resolve(&metadata.phone_number_id).await? else {
            // Unknown phone id: acknowledge and move on, providers demand
            // a fast 2xx.
            metrics::counter!("wab_webhook_unresolved_total").increment(1);
            debug!(phone_number_id = %metadata.phone_number_id, "No tenant for phone id");
            return Ok(None);
        };

        for status in &value.statuses {
            self.apply_status_event(&tenant_id, status).await?;
        }
        for message in &value.messages {
            let profile_name = value
                .contacts
                .iter()
                .find(|c| c.wa_id == message.from)
                .and_then(|c| c.profile.as_ref())
                .map(|p| p.name.clone());
            self.apply_inbound_message(&tenant_id, message, profile_name)
                .await?;
        }
        Ok(Some(tenant_id))
    }

    // ------------------------------------------------------------------
    // Status rollup
    // ------------------------------------------------------------------

    async fn apply_status_event(&self, tenant_id: &str, event: &StatusEvent) -> Result<()> {
        let Some(incoming) = MessageStatus::from_provider_status(&event.status) else {
            debug!(status = %event.status, "Unknown provider status");
            return Ok(());
        };

        // Tolerates out-of-order and unknown ids: reconciliation rides on
        // the provider message id alone.
        let Some(message) = self
            .platform
            .store
            .messages
            .find_by_provider_message_id(&event.id)
            .await?
        else {
            metrics::counter!("wab_webhook_unknown_message_total").increment(1);
            debug!(provider_message_id = %event.id, "Status for unknown message");
            return Ok(());
        };
        if message.tenant_id != tenant_id {
            warn!(provider_message_id = %event.id, "Status event crossed tenants; dropped");
            return Ok(());
        }

        let Some(outcome) = advance_plan(message.status, incoming) else {
            // Restating or regressing webhook: silently dropped.
            metrics::counter!("wab_rollup_drops_total").increment(1);
            return Ok(());
        };

        let at = parse_provider_timestamp(&event.timestamp).unwrap_or_else(Utc::now);
        let error = event
            .errors
            .first()
            .map(|e| format!("{} ({})", e.title, e.code));

        let applied = self
            .platform
            .store
            .messages
            .apply_advance(&message.id, message.status, &outcome, at, error.clone())
            .await?;
        if !applied {
            // A concurrent delivery won the guard; its rollup counts.
            metrics::counter!("wab_rollup_drops_total").increment(1);
            return Ok(());
        }

        if let Some(attribution) = &message.attribution {
            // Mirror the advance on the campaign join record.
            if let Some(contact_id) = &message.contact_id {
                if let Some(cm) = self
                    .platform
                    .store
                    .campaign_messages
                    .find(&attribution.campaign_id, contact_id)
                    .await?
                {
                    if let Some(cm_outcome) = advance_plan(cm.status, incoming) {
                        self.platform
                            .store
                            .campaign_messages
                            .apply_advance(&cm.id, cm.status, &cm_outcome, at)
                            .await?;
                    }
                }
            }

            self.platform
                .store
                .campaigns
                .increment_totals(&attribution.campaign_id, outcome.delta)
                .await?;

            if incoming == MessageStatus::Failed {
                self.platform
                    .store
                    .campaigns
                    .record_send_failure(
                        &attribution.campaign_id,
                        error.as_deref().unwrap_or("delivery failed"),
                        event.first_error_code(),
                    )
                    .await?;
            }

            self.maybe_trigger_completion(&attribution.campaign_id).await?;
        }

        // Significant transitions fan out to automation.
        if matches!(
            incoming,
            MessageStatus::Delivered | MessageStatus::Read | MessageStatus::Failed
        ) {
            self.automation
                .dispatch(
                    tenant_id,
                    &TriggerEvent::StatusUpdated {
                        contact_id: message.contact_id.clone(),
                        status: incoming,
                    },
                )
                .await;
        }

        Ok(())
    }

    async fn maybe_trigger_completion(&self, campaign_id: &str) -> Result<()> {
        let Some(campaign) = self.platform.store.campaigns.find_by_id(campaign_id).await? else {
            return Ok(());
        };
        if campaign.status == CampaignStatus::Running
            && campaign.totals.total_recipients > 0
            && campaign.totals.processed() >= campaign.totals.total_recipients
        {
            self.service.completion_check(campaign_id).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound messages
    // ------------------------------------------------------------------

    async fn apply_inbound_message(
        &self,
        tenant_id: &str,
        inbound: &InboundMessage,
        profile_name: Option<String>,
    ) -> Result<()> {
        let contact = self
            .platform
            .store
            .contacts
            .upsert_by_phone(tenant_id, &inbound.from, profile_name)
            .await?;

        let conversation = self
            .platform
            .store
            .conversations
            .ensure_open(tenant_id, &contact.id)
            .await?;

        let at = parse_provider_timestamp(&inbound.timestamp).unwrap_or_else(Utc::now);

        // A customer message outside the old window opens a new
        // user-initiated billing session.
        if !conversation.within_session_window(at) {
            let entry = wab_store::ConversationLedgerEntry::user_initiated(&conversation);
            self.platform
                .store
                .conversations
                .insert_ledger_entry(&entry)
                .await?;
        }

        let kind = match inbound.message_type.as_str() {
            "image" => MessageKind::Image,
            "video" => MessageKind::Video,
            "document" => MessageKind::Document,
            "audio" => MessageKind::Audio,
            _ => MessageKind::Text,
        };
        let body = inbound.body_text().map(str::to_string);

        let message = Message::inbound_received(
            tenant_id,
            &contact.id,
            &conversation.id,
            &inbound.from,
            kind,
            body.clone(),
            Some(inbound.id.clone()),
        );
        self.platform.store.messages.insert(&message).await?;

        // Sole writer of the 24-hour-window anchor; monotonic by contract.
        self.platform
            .store
            .conversations
            .touch_customer_message(&conversation.id, at)
            .await?;
        self.platform
            .store
            .conversations
            .increment_unread(&conversation.id)
            .await?;

        // Attribute the reply to the most recent campaign touch.
        if let Some(cm) = self
            .platform
            .store
            .campaign_messages
            .find_latest_for_contact(tenant_id, &contact.id)
            .await?
        {
            if self
                .platform
                .store
                .campaign_messages
                .mark_replied(&cm.id, at)
                .await?
            {
                self.platform
                    .store
                    .campaigns
                    .increment_totals(
                        &cm.campaign_id,
                        TotalsDelta {
                            replied: 1,
                            ..Default::default()
                        },
                    )
                    .await?;
            }
        }

        metrics::counter!("wab_inbound_messages_total").increment(1);

        let event = match &inbound.referral {
            Some(referral) => TriggerEvent::AdLead {
                contact_id: contact.id.clone(),
                conversation_id: conversation.id.clone(),
                source_id: referral.source_id.clone(),
            },
            None => TriggerEvent::MessageReceived {
                contact_id: contact.id.clone(),
                conversation_id: conversation.id.clone(),
                text: body,
            },
        };
        self.automation.dispatch(tenant_id, &event).await;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Template / quality / account propagation
    // ------------------------------------------------------------------

    async fn process_template_status(
        &self,
        waba_id: &str,
        value: &ChangeValue,
    ) -> Result<Option<String>> {
        let Some(workspace) = self
            .platform
            .store
            .workspaces
            .find_by_business_account_id(waba_id)
            .await?
        else {
            debug!(waba_id = %waba_id, "Template update for unknown WABA");
            return Ok(None);
        };

        let (Some(event), Some(name)) = (&value.event, &value.message_template_name) else {
            return Ok(Some(workspace.id));
        };
        let Some(new_status) = TemplateStatus::from_provider_event(event) else {
            debug!(event = %event, "Unknown template status event");
            return Ok(Some(workspace.id));
        };

        let Some(template) = self
            .platform
            .store
            .templates
            .find_by_name(
                &workspace.id,
                name,
                value.message_template_language.as_deref(),
            )
            .await?
        else {
            debug!(template = %name, "Template update for unknown template");
            return Ok(Some(workspace.id));
        };

        self.platform
            .store
            .templates
            .set_status(&template.id, new_status, value.reason.clone())
            .await?;
        info!(
            template = %name,
            tenant_id = %workspace.id,
            status = ?new_status,
            "Template approval state updated"
        );

        // Losing approval pauses every running campaign on the template.
        if !new_status.is_sendable() {
            let running = self
                .platform
                .store
                .campaigns
                .list_running_by_template(&template.id)
                .await?;
            for campaign in running {
                self.service
                    .system_pause(&campaign.id, PauseReason::TemplateRevoked)
                    .await?;
            }
        }

        Ok(Some(workspace.id))
    }

    async fn process_quality_update(
        &self,
        waba_id: &str,
        value: &ChangeValue,
    ) -> Result<Option<String>> {
        let Some(workspace) = self
            .platform
            .store
            .workspaces
            .find_by_business_account_id(waba_id)
            .await?
        else {
            return Ok(None);
        };

        if let Some(event) = &value.event {
            let rating = match event.to_ascii_uppercase().as_str() {
                "FLAGGED" => QualityRating::Red,
                "UNFLAGGED" => QualityRating::Green,
                other => QualityRating::from_provider(other),
            };
            self.platform
                .store
                .workspaces
                .set_quality_rating(&workspace.id, rating)
                .await?;
            if rating == QualityRating::Red {
                self.pause_all_running(&workspace.id, PauseReason::QualityDegraded)
                    .await?;
            }
        }

        if let Some(limit) = &value.current_limit {
            if let Some(tier) = MessagingTier::from_provider(limit) {
                let downgraded = tier < workspace.messaging_tier;
                self.platform
                    .store
                    .workspaces
                    .set_messaging_tier(&workspace.id, tier)
                    .await?;
                if downgraded {
                    self.pause_all_running(&workspace.id, PauseReason::TierDowngraded)
                        .await?;
                }
            }
        }

        Ok(Some(workspace.id))
    }

    async fn process_account_update(
        &self,
        waba_id: &str,
        value: &ChangeValue,
    ) -> Result<Option<String>> {
        let Some(workspace) = self
            .platform
            .store
            .workspaces
            .find_by_business_account_id(waba_id)
            .await?
        else {
            return Ok(None);
        };

        let Some(event) = &value.event else {
            return Ok(Some(workspace.id));
        };
        match event.to_ascii_uppercase().as_str() {
            "DISABLED_UPDATE" | "ACCOUNT_DISABLED" | "ACCOUNT_VIOLATION" => {
                self.platform
                    .store
                    .workspaces
                    .set_blocked(&workspace.id, true)
                    .await?;
                self.pause_all_running(&workspace.id, PauseReason::AccountBlocked)
                    .await?;
            }
            "ACCOUNT_REINSTATED" => {
                self.platform
                    .store
                    .workspaces
                    .set_blocked(&workspace.id, false)
                    .await?;
            }
            other => {
                debug!(event = %other, "Ignoring account update event");
            }
        }

        Ok(Some(workspace.id))
    }

    async fn pause_all_running(&self, tenant_id: &str, reason: PauseReason) -> Result<()> {
        let running = self
            .platform
            .store
            .campaigns
            .list_running_by_tenant(tenant_id)
            .await?;
        for campaign in running {
            self.service.system_pause(&campaign.id, reason).await?;
        }
        Ok(())
    }
}

fn parse_provider_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}
