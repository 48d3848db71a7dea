//! In-Memory Repositories
//!
//! Backend for development mode and tests. Mirrors the MongoDB backend's
//! conditional-update semantics (status-guarded transitions, monotonic
//! anchor, bounded audit trail) over process-local maps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::automation_rule::{AutomationRule, AutomationRuleRepository, TriggerKind};
use crate::batch::{
    BatchRepository, BatchStatus, BatchStatusCounts, CampaignBatch, RecipientStatus,
    RecipientUpdate,
};
use crate::campaign::{
    AuditEntry, Campaign, CampaignRepository, CampaignStatus, CampaignTransition, TotalsDelta,
    AUDIT_TRAIL_CAP,
};
use crate::campaign_message::{CampaignMessage, CampaignMessageRepository};
use crate::contact::{Contact, ContactRepository, RecipientSpec};
use crate::conversation::{
    Conversation, ConversationLedgerEntry, ConversationNote, ConversationRepository,
    ConversationStatus,
};
use crate::error::{Result, StoreError};
use crate::message::{AdvanceOutcome, Message, MessageRepository, MessageStatus};
use crate::template::{Template, TemplateRepository, TemplateStatus};
use crate::webhook_log::{WebhookLog, WebhookLogRepository, WebhookOutcome};
use crate::workspace::{day_key, month_key, PhoneStatus, Workspace, WorkspaceRepository};
use wab_common::{MessagingTier, QualityRating};

fn saturating_add(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

// ============================================================================
// Workspaces
// ============================================================================

#[derive(Default)]
pub struct MemoryWorkspaceRepository {
    items: RwLock<HashMap<String, Workspace>>,
}

#[async_trait]
impl WorkspaceRepository for MemoryWorkspaceRepository {
    async fn insert(&self, workspace: &Workspace) -> Result<()> {
        let mut items = self.items.write();
        if items.contains_key(&workspace.id) {
            return Err(StoreError::duplicate("Workspace", "_id", &workspace.id));
        }
        items.insert(workspace.id.clone(), workspace.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Workspace>> {
        Ok(self.items.read().get(id).cloned())
    }

    async fn find_by_phone_number_id(&self, phone_number_id: &str) -> Result<Option<Workspace>> {
        Ok(self
            .items
            .read()
            .values()
            .find(|w| w.credentials.phone_number_id.as_deref() == Some(phone_number_id))
            .cloned())
    }

    async fn find_by_business_account_id(&self, waba_id: &str) -> Result<Option<Workspace>> {
        Ok(self
            .items
            .read()
            .values()
            .find(|w| w.credentials.business_account_id.as_deref() == Some(waba_id))
            .cloned())
    }

    async fn update(&self, workspace: &Workspace) -> Result<()> {
        self.items
            .write()
            .insert(workspace.id.clone(), workspace.clone());
        Ok(())
    }

    async fn set_quality_rating(&self, id: &str, rating: QualityRating) -> Result<bool> {
        let mut items = self.items.write();
        match items.get_mut(id) {
            Some(w) => {
                w.quality_rating = rating;
                w.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_messaging_tier(&self, id: &str, tier: MessagingTier) -> Result<bool> {
        let mut items = self.items.write();
        match items.get_mut(id) {
            Some(w) => {
                w.messaging_tier = tier;
                w.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_phone_status(&self, id: &str, status: PhoneStatus) -> Result<bool> {
        let mut items = self.items.write();
        match items.get_mut(id) {
            Some(w) => {
                w.phone_status = status;
                w.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_blocked(&self, id: &str, blocked: bool) -> Result<bool> {
        let mut items = self.items.write();
        match items.get_mut(id) {
            Some(w) => {
                w.blocked = blocked;
                w.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn increment_usage(&self, id: &str, count: u64, at: DateTime<Utc>) -> Result<()> {
        let mut items = self.items.write();
        if let Some(w) = items.get_mut(id) {
            let dk = day_key(at);
            let mk = month_key(at);
            if w.usage.day_key != dk {
                w.usage.day_key = dk;
                w.usage.sent_today = 0;
            }
            if w.usage.month_key != mk {
                w.usage.month_key = mk;
                w.usage.sent_this_month = 0;
            }
            w.usage.sent_today += count;
            w.usage.sent_this_month += count;
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.items.write().remove(id).is_some())
    }
}

// ============================================================================
// Contacts
// ============================================================================

#[derive(Default)]
pub struct MemoryContactRepository {
    items: RwLock<HashMap<String, Contact>>,
}

#[async_trait]
impl ContactRepository for MemoryContactRepository {
    async fn insert(&self, contact: &Contact) -> Result<()> {
        self.items
            .write()
            .insert(contact.id.clone(), contact.clone());
        Ok(())
    }

    async fn find_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<Contact>> {
        Ok(self
            .items
            .read()
            .get(id)
            .filter(|c| c.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_by_ids(&self, tenant_id: &str, ids: &[String]) -> Result<Vec<Contact>> {
        let items = self.items.read();
        Ok(ids
            .iter()
            .filter_map(|id| items.get(id))
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn find_by_phone(&self, tenant_id: &str, phone: &str) -> Result<Option<Contact>> {
        Ok(self
            .items
            .read()
            .values()
            .find(|c| c.tenant_id == tenant_id && c.phone == phone)
            .cloned())
    }

    async fn upsert_by_phone(
        &self,
        tenant_id: &str,
        phone: &str,
        name: Option<String>,
    ) -> Result<Contact> {
        let mut items = self.items.write();
        if let Some(existing) = items
            .values_mut()
            .find(|c| c.tenant_id == tenant_id && c.phone == phone)
        {
            if let Some(name) = name {
                existing.name = Some(name);
                existing.updated_at = Utc::now();
            }
            return Ok(existing.clone());
        }
        let mut contact = Contact::new(tenant_id, phone);
        contact.name = name;
        items.insert(contact.id.clone(), contact.clone());
        Ok(contact)
    }

    async fn update(&self, contact: &Contact) -> Result<()> {
        self.items
            .write()
            .insert(contact.id.clone(), contact.clone());
        Ok(())
    }

    async fn add_tag(&self, tenant_id: &str, id: &str, tag: &str) -> Result<bool> {
        let mut items = self.items.write();
        match items.get_mut(id).filter(|c| c.tenant_id == tenant_id) {
            Some(c) => {
                if !c.tags.iter().any(|t| t == tag) {
                    c.tags.push(tag.to_string());
                }
                c.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_tag(&self, tenant_id: &str, id: &str, tag: &str) -> Result<bool> {
        let mut items = self.items.write();
        match items.get_mut(id).filter(|c| c.tenant_id == tenant_id) {
            Some(c) => {
                c.tags.retain(|t| t != tag);
                c.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn resolve_recipients(
        &self,
        tenant_id: &str,
        spec: &RecipientSpec,
    ) -> Result<Vec<Contact>> {
        let items = self.items.read();
        let eligible = items
            .values()
            .filter(|c| c.tenant_id == tenant_id && !c.opted_out);
        let mut resolved: Vec<Contact> = match spec {
            RecipientSpec::Static { contact_ids } => eligible
                .filter(|c| contact_ids.contains(&c.id))
                .cloned()
                .collect(),
            RecipientSpec::All => eligible.cloned().collect(),
            RecipientSpec::Tags { tags } => eligible
                .filter(|c| c.tags.iter().any(|t| tags.contains(t)))
                .cloned()
                .collect(),
            RecipientSpec::Segment { segment_id } => {
                let tag = format!("segment:{segment_id}");
                eligible
                    .filter(|c| c.tags.iter().any(|t| *t == tag))
                    .cloned()
                    .collect()
            }
        };
        resolved.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(resolved)
    }

    async fn delete_all_for_tenant(&self, tenant_id: &str) -> Result<u64> {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|_, c| c.tenant_id != tenant_id);
        Ok((before - items.len()) as u64)
    }
}

// ============================================================================
// Templates
// ============================================================================

#[derive(Default)]
pub struct MemoryTemplateRepository {
    items: RwLock<HashMap<String, Template>>,
}

#[async_trait]
impl TemplateRepository for MemoryTemplateRepository {
    async fn insert(&self, template: &Template) -> Result<()> {
        self.items
            .write()
            .insert(template.id.clone(), template.clone());
        Ok(())
    }

    async fn find_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<Template>> {
        Ok(self
            .items
            .read()
            .get(id)
            .filter(|t| t.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_any_by_id(&self, id: &str) -> Result<Option<Template>> {
        Ok(self.items.read().get(id).cloned())
    }

    async fn find_by_name(
        &self,
        tenant_id: &str,
        name: &str,
        language: Option<&str>,
    ) -> Result<Option<Template>> {
        Ok(self
            .items
            .read()
            .values()
            .find(|t| {
                t.tenant_id == tenant_id
                    && t.name == name
                    && language.map(|l| t.language == l).unwrap_or(true)
            })
            .cloned())
    }

    async fn update(&self, template: &Template) -> Result<()> {
        self.items
            .write()
            .insert(template.id.clone(), template.clone());
        Ok(())
    }

    async fn set_status(
        &self,
        id: &str,
        status: TemplateStatus,
        reason: Option<String>,
    ) -> Result<bool> {
        let mut items = self.items.write();
        match items.get_mut(id) {
            Some(t) => {
                t.status = status;
                if reason.is_some() {
                    t.rejection_reason = reason;
                }
                t.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_sendable(&self, tenant_id: &str) -> Result<Vec<Template>> {
        Ok(self
            .items
            .read()
            .values()
            .filter(|t| t.tenant_id == tenant_id && t.status == TemplateStatus::Approved)
            .cloned()
            .collect())
    }

    async fn delete_all_for_tenant(&self, tenant_id: &str) -> Result<u64> {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|_, t| t.tenant_id != tenant_id);
        Ok((before - items.len()) as u64)
    }
}

// ============================================================================
// Campaigns
// ============================================================================

#[derive(Default)]
pub struct MemoryCampaignRepository {
    items: RwLock<HashMap<String, Campaign>>,
}

#[async_trait]
impl CampaignRepository for MemoryCampaignRepository {
    async fn insert(&self, campaign: &Campaign) -> Result<()> {
        self.items
            .write()
            .insert(campaign.id.clone(), campaign.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Campaign>> {
        Ok(self.items.read().get(id).cloned())
    }

    async fn find_for_tenant(&self, tenant_id: &str, id: &str) -> Result<Option<Campaign>> {
        Ok(self
            .items
            .read()
            .get(id)
            .filter(|c| c.tenant_id == tenant_id)
            .cloned())
    }

    async fn update(&self, campaign: &Campaign) -> Result<()> {
        self.items
            .write()
            .insert(campaign.id.clone(), campaign.clone());
        Ok(())
    }

    async fn try_transition(
        &self,
        id: &str,
        from: &[CampaignStatus],
        transition: CampaignTransition,
    ) -> Result<bool> {
        let mut items = self.items.write();
        let Some(campaign) = items.get_mut(id) else {
            return Ok(false);
        };
        if !from.contains(&campaign.status) {
            return Ok(false);
        }
        if let Some(to) = transition.to {
            campaign.status = to;
        }
        if let Some(reason) = transition.paused_reason {
            campaign.paused_reason = reason;
        }
        if let Some(at) = transition.started_at {
            campaign.started_at = Some(at);
        }
        if let Some(at) = transition.paused_at {
            campaign.paused_at = Some(at);
        }
        if let Some(at) = transition.completed_at {
            campaign.completed_at = Some(at);
        }
        if let Some(entry) = transition.audit {
            campaign.push_audit(entry);
        }
        campaign.updated_at = Utc::now();
        Ok(true)
    }

    async fn increment_totals(&self, id: &str, delta: TotalsDelta) -> Result<()> {
        let mut items = self.items.write();
        if let Some(c) = items.get_mut(id) {
            c.totals.queued = saturating_add(c.totals.queued, delta.queued);
            c.totals.sent = saturating_add(c.totals.sent, delta.sent);
            c.totals.delivered = saturating_add(c.totals.delivered, delta.delivered);
            c.totals.read = saturating_add(c.totals.read, delta.read);
            c.totals.failed = saturating_add(c.totals.failed, delta.failed);
            c.totals.replied = saturating_add(c.totals.replied, delta.replied);
        }
        Ok(())
    }

    async fn set_outcome_totals(
        &self,
        id: &str,
        sent: u64,
        failed: u64,
        queued: u64,
    ) -> Result<()> {
        let mut items = self.items.write();
        if let Some(c) = items.get_mut(id) {
            c.totals.sent = sent;
            c.totals.failed = failed;
            c.totals.queued = queued;
            c.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_batching_plan(
        &self,
        id: &str,
        total_recipients: u64,
        batch_size: u32,
        total_batches: u32,
    ) -> Result<()> {
        let mut items = self.items.write();
        if let Some(c) = items.get_mut(id) {
            c.totals.total_recipients = total_recipients;
            c.totals.queued = total_recipients;
            c.batching.batch_size = batch_size;
            c.batching.total_batches = total_batches;
            c.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn increment_completed_batches(&self, id: &str) -> Result<()> {
        let mut items = self.items.write();
        if let Some(c) = items.get_mut(id) {
            c.batching.completed_batches += 1;
        }
        Ok(())
    }

    async fn increment_failed_batches(&self, id: &str) -> Result<()> {
        let mut items = self.items.write();
        if let Some(c) = items.get_mut(id) {
            c.batching.failed_batches += 1;
        }
        Ok(())
    }

    async fn record_send_failure(
        &self,
        id: &str,
        error: &str,
        provider_code: Option<i64>,
    ) -> Result<()> {
        let mut items = self.items.write();
        if let Some(c) = items.get_mut(id) {
            c.failure.consecutive_failures += 1;
            c.failure.last_error = Some(error.to_string());
            c.failure.last_failure_at = Some(Utc::now());
            if let Some(code) = provider_code {
                c.failure.last_error_codes.push(code);
                let len = c.failure.last_error_codes.len();
                if len > 10 {
                    c.failure.last_error_codes.drain(..len - 10);
                }
            }
        }
        Ok(())
    }

    async fn clear_consecutive_failures(&self, id: &str) -> Result<()> {
        let mut items = self.items.write();
        if let Some(c) = items.get_mut(id) {
            c.failure.consecutive_failures = 0;
        }
        Ok(())
    }

    async fn push_audit(&self, id: &str, entry: AuditEntry) -> Result<()> {
        let mut items = self.items.write();
        if let Some(c) = items.get_mut(id) {
            c.push_audit(entry);
        }
        Ok(())
    }

    async fn list_running_by_template(&self, template_id: &str) -> Result<Vec<Campaign>> {
        Ok(self
            .items
            .read()
            .values()
            .filter(|c| {
                c.status == CampaignStatus::Running && c.template.template_id == template_id
            })
            .cloned()
            .collect())
    }

    async fn list_running_by_tenant(&self, tenant_id: &str) -> Result<Vec<Campaign>> {
        Ok(self
            .items
            .read()
            .values()
            .filter(|c| c.status == CampaignStatus::Running && c.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Campaign>> {
        Ok(self
            .items
            .read()
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn find_due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        Ok(self
            .items
            .read()
            .values()
            .filter(|c| {
                c.status == CampaignStatus::Scheduled
                    && matches!(c.scheduled_at, Some(at) if at <= now)
            })
            .cloned()
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.items.write().remove(id).is_some())
    }

    async fn delete_all_for_tenant(&self, tenant_id: &str) -> Result<u64> {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|_, c| c.tenant_id != tenant_id);
        Ok((before - items.len()) as u64)
    }
}

// ============================================================================
// Campaign batches
// ============================================================================

#[derive(Default)]
pub struct MemoryBatchRepository {
    items: RwLock<HashMap<String, CampaignBatch>>,
}

#[async_trait]
impl BatchRepository for MemoryBatchRepository {
    async fn insert_many(&self, batches: &[CampaignBatch]) -> Result<()> {
        let mut items = self.items.write();
        for batch in batches {
            items.insert(batch.id.clone(), batch.clone());
        }
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<CampaignBatch>> {
        Ok(self.items.read().get(id).cloned())
    }

    async fn find_by_campaign(&self, campaign_id: &str) -> Result<Vec<CampaignBatch>> {
        let mut batches: Vec<CampaignBatch> = self
            .items
            .read()
            .values()
            .filter(|b| b.campaign_id == campaign_id)
            .cloned()
            .collect();
        batches.sort_by_key(|b| b.index);
        Ok(batches)
    }

    async fn try_transition(
        &self,
        id: &str,
        from: &[BatchStatus],
        to: BatchStatus,
    ) -> Result<bool> {
        let mut items = self.items.write();
        let Some(batch) = items.get_mut(id) else {
            return Ok(false);
        };
        // Batch finality: COMPLETED is never a transition source.
        if batch.status.is_final() || !from.contains(&batch.status) {
            return Ok(false);
        }
        batch.status = to;
        batch.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_processing(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut items = self.items.write();
        let Some(batch) = items.get_mut(id) else {
            return Ok(false);
        };
        if !matches!(
            batch.status,
            BatchStatus::Pending | BatchStatus::Queued | BatchStatus::Failed
        ) {
            return Ok(false);
        }
        batch.status = BatchStatus::Processing;
        batch.processing_started_at = Some(at);
        batch.attempts += 1;
        batch.updated_at = at;
        Ok(true)
    }

    async fn reclaim_stale_processing(
        &self,
        id: &str,
        cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut items = self.items.write();
        let Some(batch) = items.get_mut(id) else {
            return Ok(false);
        };
        let stale = batch.status == BatchStatus::Processing
            && matches!(batch.processing_started_at, Some(started) if started < cutoff);
        if !stale {
            return Ok(false);
        }
        batch.processing_started_at = Some(at);
        batch.attempts += 1;
        batch.updated_at = at;
        Ok(true)
    }

    async fn mark_completed(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut items = self.items.write();
        let Some(batch) = items.get_mut(id) else {
            return Ok(false);
        };
        if batch.status != BatchStatus::Processing {
            return Ok(false);
        }
        batch.status = BatchStatus::Completed;
        batch.completed_at = Some(at);
        batch.updated_at = at;
        Ok(true)
    }

    async fn update_recipient(
        &self,
        batch_id: &str,
        contact_id: &str,
        update: RecipientUpdate,
    ) -> Result<bool> {
        let mut items = self.items.write();
        let Some(batch) = items.get_mut(batch_id) else {
            return Ok(false);
        };
        let Some(recipient) = batch
            .recipients
            .iter_mut()
            .find(|r| r.contact_id == contact_id)
        else {
            return Ok(false);
        };
        recipient.status = update.status;
        if update.provider_message_id.is_some() {
            recipient.provider_message_id = update.provider_message_id;
        }
        if update.error.is_some() {
            recipient.error = update.error;
        }
        recipient.processed_at = Some(update.processed_at);
        batch.updated_at = Utc::now();
        Ok(true)
    }

    async fn pause_nonfinal(&self, campaign_id: &str) -> Result<u64> {
        let mut items = self.items.write();
        let mut paused = 0;
        for batch in items.values_mut() {
            if batch.campaign_id == campaign_id
                && matches!(batch.status, BatchStatus::Pending | BatchStatus::Queued)
            {
                batch.status = BatchStatus::Paused;
                batch.updated_at = Utc::now();
                paused += 1;
            }
        }
        Ok(paused)
    }

    async fn find_resumable(&self, campaign_id: &str) -> Result<Vec<CampaignBatch>> {
        let mut batches: Vec<CampaignBatch> = self
            .items
            .read()
            .values()
            .filter(|b| b.campaign_id == campaign_id && b.status.is_resumable())
            .cloned()
            .collect();
        batches.sort_by_key(|b| b.index);
        Ok(batches)
    }

    async fn counts_by_status(&self, campaign_id: &str) -> Result<BatchStatusCounts> {
        let items = self.items.read();
        let mut counts = BatchStatusCounts::default();
        for batch in items.values().filter(|b| b.campaign_id == campaign_id) {
            match batch.status {
                BatchStatus::Pending => counts.pending += 1,
                BatchStatus::Queued => counts.queued += 1,
                BatchStatus::Processing => counts.processing += 1,
                BatchStatus::Completed => counts.completed += 1,
                BatchStatus::Failed => counts.failed += 1,
                BatchStatus::Paused => counts.paused += 1,
            }
        }
        Ok(counts)
    }

    async fn recipient_outcome_counts(&self, campaign_id: &str) -> Result<(u64, u64)> {
        let items = self.items.read();
        let mut sent = 0;
        let mut failed = 0;
        for batch in items.values().filter(|b| b.campaign_id == campaign_id) {
            for recipient in &batch.recipients {
                match recipient.status {
                    RecipientStatus::Sent => sent += 1,
                    RecipientStatus::Failed => failed += 1,
                    _ => {}
                }
            }
        }
        Ok((sent, failed))
    }

    async fn find_stale_processing(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CampaignBatch>> {
        Ok(self
            .items
            .read()
            .values()
            .filter(|b| {
                b.status == BatchStatus::Processing
                    && matches!(b.processing_started_at, Some(at) if at < cutoff)
            })
            .cloned()
            .collect())
    }

    async fn delete_all_for_campaign(&self, campaign_id: &str) -> Result<u64> {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|_, b| b.campaign_id != campaign_id);
        Ok((before - items.len()) as u64)
    }
}

// ============================================================================
// Campaign messages
// ============================================================================

#[derive(Default)]
pub struct MemoryCampaignMessageRepository {
    items: RwLock<HashMap<String, CampaignMessage>>,
}

#[async_trait]
impl CampaignMessageRepository for MemoryCampaignMessageRepository {
    async fn upsert_send_outcome(
        &self,
        campaign_id: &str,
        contact_id: &str,
        tenant_id: &str,
        status: MessageStatus,
        provider_message_id: Option<String>,
        error: Option<String>,
    ) -> Result<CampaignMessage> {
        let mut items = self.items.write();
        let now = Utc::now();
        let existing = items
            .values_mut()
            .find(|m| m.campaign_id == campaign_id && m.contact_id == contact_id);
        if let Some(m) = existing {
            m.status = status;
            m.attempt_count += 1;
            if provider_message_id.is_some() {
                m.provider_message_id = provider_message_id;
            }
            if error.is_some() {
                m.last_error = error;
            }
            match status {
                MessageStatus::Sent => m.sent_at = Some(now),
                MessageStatus::Failed => m.failed_at = Some(now),
                _ => {}
            }
            m.updated_at = now;
            return Ok(m.clone());
        }

        let mut message = CampaignMessage::new(campaign_id, contact_id, tenant_id, status);
        message.attempt_count = 1;
        message.provider_message_id = provider_message_id;
        message.last_error = error;
        match status {
            MessageStatus::Sent => message.sent_at = Some(now),
            MessageStatus::Failed => message.failed_at = Some(now),
            _ => {}
        }
        items.insert(message.id.clone(), message.clone());
        Ok(message)
    }

    async fn find(
        &self,
        campaign_id: &str,
        contact_id: &str,
    ) -> Result<Option<CampaignMessage>> {
        Ok(self
            .items
            .read()
            .values()
            .find(|m| m.campaign_id == campaign_id && m.contact_id == contact_id)
            .cloned())
    }

    async fn apply_advance(
        &self,
        id: &str,
        expected_current: MessageStatus,
        outcome: &AdvanceOutcome,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut items = self.items.write();
        let Some(m) = items.get_mut(id) else {
            return Ok(false);
        };
        if m.status != expected_current {
            return Ok(false);
        }
        m.status = outcome.new_status;
        for reached in &outcome.reached {
            match reached {
                MessageStatus::Sent => m.sent_at = Some(at),
                MessageStatus::Delivered => m.delivered_at = Some(at),
                MessageStatus::Read => m.read_at = Some(at),
                MessageStatus::Failed => m.failed_at = Some(at),
                _ => {}
            }
        }
        m.updated_at = at;
        Ok(true)
    }

    async fn mark_replied(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut items = self.items.write();
        let Some(m) = items.get_mut(id) else {
            return Ok(false);
        };
        if m.replied_at.is_some() {
            return Ok(false);
        }
        m.replied_at = Some(at);
        m.updated_at = at;
        Ok(true)
    }

    async fn count_queued(&self, campaign_id: &str) -> Result<u64> {
        Ok(self
            .items
            .read()
            .values()
            .filter(|m| {
                m.campaign_id == campaign_id
                    && matches!(m.status, MessageStatus::Queued | MessageStatus::Sending)
            })
            .count() as u64)
    }

    async fn find_latest_for_contact(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Option<CampaignMessage>> {
        Ok(self
            .items
            .read()
            .values()
            .filter(|m| m.tenant_id == tenant_id && m.contact_id == contact_id)
            .max_by_key(|m| m.updated_at)
            .cloned())
    }

    async fn delete_all_for_campaign(&self, campaign_id: &str) -> Result<u64> {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|_, m| m.campaign_id != campaign_id);
        Ok((before - items.len()) as u64)
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Default)]
pub struct MemoryMessageRepository {
    items: RwLock<HashMap<String, Message>>,
}

#[async_trait]
impl MessageRepository for MemoryMessageRepository {
    async fn insert(&self, message: &Message) -> Result<()> {
        self.items
            .write()
            .insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Message>> {
        Ok(self.items.read().get(id).cloned())
    }

    async fn find_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<Message>> {
        Ok(self
            .items
            .read()
            .values()
            .find(|m| m.provider_message_id.as_deref() == Some(provider_message_id))
            .cloned())
    }

    async fn apply_advance(
        &self,
        id: &str,
        expected_current: MessageStatus,
        outcome: &AdvanceOutcome,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<bool> {
        let mut items = self.items.write();
        let Some(m) = items.get_mut(id) else {
            return Ok(false);
        };
        if m.status != expected_current {
            return Ok(false);
        }
        m.status = outcome.new_status;
        for reached in &outcome.reached {
            match reached {
                MessageStatus::Sent => m.sent_at = Some(at),
                MessageStatus::Delivered => m.delivered_at = Some(at),
                MessageStatus::Read => m.read_at = Some(at),
                MessageStatus::Failed => m.failed_at = Some(at),
                _ => {}
            }
        }
        if error.is_some() {
            m.last_error = error;
        }
        Ok(true)
    }

    async fn list_for_campaign(&self, campaign_id: &str, limit: i64) -> Result<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .items
            .read()
            .values()
            .filter(|m| {
                m.attribution
                    .as_ref()
                    .map(|a| a.campaign_id == campaign_id)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        messages.truncate(limit as usize);
        Ok(messages)
    }

    async fn delete_all_for_tenant(&self, tenant_id: &str) -> Result<u64> {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|_, m| m.tenant_id != tenant_id);
        Ok((before - items.len()) as u64)
    }
}

// ============================================================================
// Conversations
// ============================================================================

#[derive(Default)]
pub struct MemoryConversationRepository {
    items: RwLock<HashMap<String, Conversation>>,
    ledger: RwLock<Vec<ConversationLedgerEntry>>,
}

impl MemoryConversationRepository {
    /// Ledger snapshot for assertions in tests.
    pub fn ledger_entries(&self) -> Vec<ConversationLedgerEntry> {
        self.ledger.read().clone()
    }
}

#[async_trait]
impl ConversationRepository for MemoryConversationRepository {
    async fn ensure_open(&self, tenant_id: &str, contact_id: &str) -> Result<Conversation> {
        let mut items = self.items.write();
        if let Some(existing) = items.values().find(|c| {
            c.tenant_id == tenant_id
                && c.contact_id == contact_id
                && c.status == ConversationStatus::Open
        }) {
            return Ok(existing.clone());
        }
        let conversation = Conversation::new(tenant_id, contact_id);
        items.insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Conversation>> {
        Ok(self.items.read().get(id).cloned())
    }

    async fn find_for_contact(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Option<Conversation>> {
        Ok(self
            .items
            .read()
            .values()
            .find(|c| {
                c.tenant_id == tenant_id
                    && c.contact_id == contact_id
                    && c.status == ConversationStatus::Open
            })
            .cloned())
    }

    async fn touch_customer_message(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut items = self.items.write();
        let Some(c) = items.get_mut(id) else {
            return Ok(false);
        };
        // Monotonic: never move the anchor backwards.
        match c.last_customer_message_at {
            Some(existing) if existing >= at => {}
            _ => c.last_customer_message_at = Some(at),
        }
        c.updated_at = Utc::now();
        Ok(true)
    }

    async fn increment_unread(&self, id: &str) -> Result<()> {
        let mut items = self.items.write();
        if let Some(c) = items.get_mut(id) {
            c.unread_count += 1;
        }
        Ok(())
    }

    async fn set_assignee(&self, id: &str, assignee: Option<String>) -> Result<bool> {
        let mut items = self.items.write();
        match items.get_mut(id) {
            Some(c) => {
                c.assignee = assignee;
                c.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_status(&self, id: &str, status: ConversationStatus) -> Result<bool> {
        let mut items = self.items.write();
        match items.get_mut(id) {
            Some(c) => {
                c.status = status;
                c.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn add_tag(&self, id: &str, tag: &str) -> Result<bool> {
        let mut items = self.items.write();
        match items.get_mut(id) {
            Some(c) => {
                if !c.tags.iter().any(|t| t == tag) {
                    c.tags.push(tag.to_string());
                }
                c.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_tag(&self, id: &str, tag: &str) -> Result<bool> {
        let mut items = self.items.write();
        match items.get_mut(id) {
            Some(c) => {
                c.tags.retain(|t| t != tag);
                c.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn add_note(&self, id: &str, note: ConversationNote) -> Result<bool> {
        let mut items = self.items.write();
        match items.get_mut(id) {
            Some(c) => {
                c.notes.push(note);
                c.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count_open_by_assignee(&self, tenant_id: &str, assignee: &str) -> Result<u64> {
        Ok(self
            .items
            .read()
            .values()
            .filter(|c| {
                c.tenant_id == tenant_id
                    && c.status == ConversationStatus::Open
                    && c.assignee.as_deref() == Some(assignee)
            })
            .count() as u64)
    }

    async fn insert_ledger_entry(&self, entry: &ConversationLedgerEntry) -> Result<()> {
        self.ledger.write().push(entry.clone());
        Ok(())
    }

    async fn delete_all_for_tenant(&self, tenant_id: &str) -> Result<u64> {
        self.ledger.write().retain(|e| e.tenant_id != tenant_id);
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|_, c| c.tenant_id != tenant_id);
        Ok((before - items.len()) as u64)
    }
}

// ============================================================================
// Automation rules
// ============================================================================

#[derive(Default)]
pub struct MemoryAutomationRuleRepository {
    items: RwLock<HashMap<String, AutomationRule>>,
}

#[async_trait]
impl AutomationRuleRepository for MemoryAutomationRuleRepository {
    async fn insert(&self, rule: &AutomationRule) -> Result<()> {
        self.items.write().insert(rule.id.clone(), rule.clone());
        Ok(())
    }

    async fn find_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<AutomationRule>> {
        Ok(self
            .items
            .read()
            .get(id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_enabled_by_trigger(
        &self,
        tenant_id: &str,
        trigger: TriggerKind,
    ) -> Result<Vec<AutomationRule>> {
        let mut rules: Vec<AutomationRule> = self
            .items
            .read()
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.trigger == trigger && r.enabled)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rules)
    }

    async fn record_execution(
        &self,
        id: &str,
        success: bool,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut items = self.items.write();
        if let Some(rule) = items.get_mut(id) {
            let dk = day_key(at);
            if rule.executions_day_key != dk {
                rule.executions_day_key = dk;
                rule.executions_today = 0;
            }
            rule.executions_today += 1;
            if success {
                rule.success_count += 1;
            } else {
                rule.failure_count += 1;
                if error.is_some() {
                    rule.last_error = error;
                }
            }
            rule.updated_at = at;
        }
        Ok(())
    }

    async fn set_enabled(&self, tenant_id: &str, id: &str, enabled: bool) -> Result<bool> {
        let mut items = self.items.write();
        match items.get_mut(id).filter(|r| r.tenant_id == tenant_id) {
            Some(rule) => {
                rule.enabled = enabled;
                rule.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_all_for_tenant(&self, tenant_id: &str) -> Result<u64> {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|_, r| r.tenant_id != tenant_id);
        Ok((before - items.len()) as u64)
    }
}

// ============================================================================
// Webhook log
// ============================================================================

#[derive(Default)]
pub struct MemoryWebhookLogRepository {
    items: RwLock<HashMap<String, WebhookLog>>,
}

#[async_trait]
impl WebhookLogRepository for MemoryWebhookLogRepository {
    async fn insert(&self, log: &WebhookLog) -> Result<()> {
        self.items.write().insert(log.id.clone(), log.clone());
        Ok(())
    }

    async fn set_outcome(
        &self,
        id: &str,
        tenant_id: Option<String>,
        outcome: WebhookOutcome,
        error: Option<String>,
    ) -> Result<()> {
        let mut items = self.items.write();
        if let Some(log) = items.get_mut(id) {
            log.outcome = outcome;
            if tenant_id.is_some() {
                log.tenant_id = tenant_id;
            }
            if error.is_some() {
                log.error = error;
            }
        }
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<WebhookLog>> {
        Ok(self.items.read().get(id).cloned())
    }
}
