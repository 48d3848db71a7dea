//! MongoDB Repositories
//!
//! One repository per aggregate over a typed `Collection<T>`. Counter
//! rollups are `$inc` updates and status changes are conditional
//! `update_one` writes so concurrent workers coordinate through the
//! database, never through in-process state.

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{Collection, Database};

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

/// Serialize a unit enum to its BSON string value for use in filters.
fn enum_bson<T: serde::Serialize>(value: &T) -> Result<Bson> {
    Ok(bson::to_bson(value)?)
}

fn statuses_bson<T: serde::Serialize>(values: &[T]) -> Result<Vec<Bson>> {
    values.iter().map(enum_bson).collect()
}

// ============================================================================
// Workspaces
// ============================================================================

pub struct MongoWorkspaceRepository {
    collection: Collection<Workspace>,
}

impl MongoWorkspaceRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("workspaces"),
        }
    }
}

#[async_trait]
impl WorkspaceRepository for MongoWorkspaceRepository {
    async fn insert(&self, workspace: &Workspace) -> Result<()> {
        self.collection.insert_one(workspace).await?;
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Workspace>> {
        Ok(self.collection.find_one(doc! { "_id": id }).await?)
    }

    async fn find_by_phone_number_id(&self, phone_number_id: &str) -> Result<Option<Workspace>> {
        Ok(self
            .collection
            .find_one(doc! { "credentials.phoneNumberId": phone_number_id })
            .await?)
    }

    async fn find_by_business_account_id(&self, waba_id: &str) -> Result<Option<Workspace>> {
        Ok(self
            .collection
            .find_one(doc! { "credentials.businessAccountId": waba_id })
            .await?)
    }

    async fn update(&self, workspace: &Workspace) -> Result<()> {
        self.collection
            .replace_one(doc! { "_id": &workspace.id }, workspace)
            .await?;
        Ok(())
    }

    async fn set_quality_rating(&self, id: &str, rating: QualityRating) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { "qualityRating": enum_bson(&rating)?, "updatedAt": Utc::now() } },
            )
            .await?;
        Ok(result.modified_count > 0)
    }

    async fn set_messaging_tier(&self, id: &str, tier: MessagingTier) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { "messagingTier": enum_bson(&tier)?, "updatedAt": Utc::now() } },
            )
            .await?;
        Ok(result.modified_count > 0)
    }

    async fn set_phone_status(&self, id: &str, status: PhoneStatus) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { "phoneStatus": enum_bson(&status)?, "updatedAt": Utc::now() } },
            )
            .await?;
        Ok(result.modified_count > 0)
    }

    async fn set_blocked(&self, id: &str, blocked: bool) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { "blocked": blocked, "updatedAt": Utc::now() } },
            )
            .await?;
        Ok(result.modified_count > 0)
    }

    async fn increment_usage(&self, id: &str, count: u64, at: DateTime<Utc>) -> Result<()> {
        let dk = day_key(at);
        let mk = month_key(at);

        // Reset counters whose window key rolled over, then increment.
        self.collection
            .update_one(
                doc! { "_id": id, "usage.dayKey": { "$ne": &dk } },
                doc! { "$set": { "usage.dayKey": &dk, "usage.sentToday": 0i64 } },
            )
            .await?;
        self.collection
            .update_one(
                doc! { "_id": id, "usage.monthKey": { "$ne": &mk } },
                doc! { "$set": { "usage.monthKey": &mk, "usage.sentThisMonth": 0i64 } },
            )
            .await?;
        self.collection
            .update_one(
                doc! { "_id": id },
                doc! { "$inc": {
                    "usage.sentToday": count as i64,
                    "usage.sentThisMonth": count as i64,
                } },
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = self.collection.delete_one(doc! { "_id": id }).await?;
        Ok(result.deleted_count > 0)
    }
}

// ============================================================================
// Contacts
// ============================================================================

pub struct MongoContactRepository {
    collection: Collection<Contact>,
}

impl MongoContactRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("contacts"),
        }
    }
}

#[async_trait]
impl ContactRepository for MongoContactRepository {
    async fn insert(&self, contact: &Contact) -> Result<()> {
        self.collection.insert_one(contact).await?;
        Ok(())
    }

    async fn find_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<Contact>> {
        Ok(self
            .collection
            .find_one(doc! { "_id": id, "tenantId": tenant_id })
            .await?)
    }

    async fn find_by_ids(&self, tenant_id: &str, ids: &[String]) -> Result<Vec<Contact>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let cursor = self
            .collection
            .find(doc! { "tenantId": tenant_id, "_id": { "$in": ids } })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn find_by_phone(&self, tenant_id: &str, phone: &str) -> Result<Option<Contact>> {
        Ok(self
            .collection
            .find_one(doc! { "tenantId": tenant_id, "phone": phone })
            .await?)
    }

    async fn upsert_by_phone(
        &self,
        tenant_id: &str,
        phone: &str,
        name: Option<String>,
    ) -> Result<Contact> {
        if let Some(mut existing) = self.find_by_phone(tenant_id, phone).await? {
            if let Some(name) = name {
                if existing.name.as_deref() != Some(name.as_str()) {
                    existing.name = Some(name);
                    existing.updated_at = Utc::now();
                    self.update(&existing).await?;
                }
            }
            return Ok(existing);
        }

        let mut contact = Contact::new(tenant_id, phone);
        contact.name = name;
        self.insert(&contact).await?;
        Ok(contact)
    }

    async fn update(&self, contact: &Contact) -> Result<()> {
        self.collection
            .replace_one(doc! { "_id": &contact.id }, contact)
            .await?;
        Ok(())
    }

    async fn add_tag(&self, tenant_id: &str, id: &str, tag: &str) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": id, "tenantId": tenant_id },
                doc! { "$addToSet": { "tags": tag }, "$set": { "updatedAt": Utc::now() } },
            )
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn remove_tag(&self, tenant_id: &str, id: &str, tag: &str) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": id, "tenantId": tenant_id },
                doc! { "$pull": { "tags": tag }, "$set": { "updatedAt": Utc::now() } },
            )
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn resolve_recipients(
        &self,
        tenant_id: &str,
        spec: &RecipientSpec,
    ) -> Result<Vec<Contact>> {
        let mut filter = doc! { "tenantId": tenant_id, "optedOut": { "$ne": true } };
        match spec {
            RecipientSpec::Static { contact_ids } => {
                if contact_ids.is_empty() {
                    return Ok(Vec::new());
                }
                filter.insert("_id", doc! { "$in": contact_ids });
            }
            RecipientSpec::All => {}
            RecipientSpec::Tags { tags } => {
                filter.insert("tags", doc! { "$in": tags });
            }
            RecipientSpec::Segment { segment_id } => {
                // Segments are materialized by the contacts subsystem as a
                // tag carrying the segment id.
                filter.insert("tags", format!("segment:{segment_id}"));
            }
        }
        let cursor = self.collection.find(filter).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn delete_all_for_tenant(&self, tenant_id: &str) -> Result<u64> {
        let result = self
            .collection
            .delete_many(doc! { "tenantId": tenant_id })
            .await?;
        Ok(result.deleted_count)
    }
}

// ============================================================================
// Templates
// ============================================================================

pub struct MongoTemplateRepository {
    collection: Collection<Template>,
}

impl MongoTemplateRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("templates"),
        }
    }
}

#[async_trait]
impl TemplateRepository for MongoTemplateRepository {
    async fn insert(&self, template: &Template) -> Result<()> {
        self.collection.insert_one(template).await?;
        Ok(())
    }

    async fn find_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<Template>> {
        Ok(self
            .collection
            .find_one(doc! { "_id": id, "tenantId": tenant_id })
            .await?)
    }

    async fn find_any_by_id(&self, id: &str) -> Result<Option<Template>> {
        Ok(self.collection.find_one(doc! { "_id": id }).await?)
    }

    async fn find_by_name(
        &self,
        tenant_id: &str,
        name: &str,
        language: Option<&str>,
    ) -> Result<Option<Template>> {
        let mut filter = doc! { "tenantId": tenant_id, "name": name };
        if let Some(language) = language {
            filter.insert("language", language);
        }
        Ok(self.collection.find_one(filter).await?)
    }

    async fn update(&self, template: &Template) -> Result<()> {
        self.collection
            .replace_one(doc! { "_id": &template.id }, template)
            .await?;
        Ok(())
    }

    async fn set_status(
        &self,
        id: &str,
        status: TemplateStatus,
        reason: Option<String>,
    ) -> Result<bool> {
        let mut set = doc! { "status": enum_bson(&status)?, "updatedAt": Utc::now() };
        if let Some(reason) = reason {
            set.insert("rejectionReason", reason);
        }
        let result = self
            .collection
            .update_one(doc! { "_id": id }, doc! { "$set": set })
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn list_sendable(&self, tenant_id: &str) -> Result<Vec<Template>> {
        let cursor = self
            .collection
            .find(doc! { "tenantId": tenant_id, "status": "APPROVED" })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn delete_all_for_tenant(&self, tenant_id: &str) -> Result<u64> {
        let result = self
            .collection
            .delete_many(doc! { "tenantId": tenant_id })
            .await?;
        Ok(result.deleted_count)
    }
}

// ============================================================================
// Campaigns
// ============================================================================

pub struct MongoCampaignRepository {
    collection: Collection<Campaign>,
}

impl MongoCampaignRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("campaigns"),
        }
    }
}

#[async_trait]
impl CampaignRepository for MongoCampaignRepository {
    async fn insert(&self, campaign: &Campaign) -> Result<()> {
        self.collection.insert_one(campaign).await?;
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Campaign>> {
        Ok(self.collection.find_one(doc! { "_id": id }).await?)
    }

    async fn find_for_tenant(&self, tenant_id: &str, id: &str) -> Result<Option<Campaign>> {
        Ok(self
            .collection
            .find_one(doc! { "_id": id, "tenantId": tenant_id })
            .await?)
    }

    async fn update(&self, campaign: &Campaign) -> Result<()> {
        self.collection
            .replace_one(doc! { "_id": &campaign.id }, campaign)
            .await?;
        Ok(())
    }

    async fn try_transition(
        &self,
        id: &str,
        from: &[CampaignStatus],
        transition: CampaignTransition,
    ) -> Result<bool> {
        let filter = doc! {
            "_id": id,
            "status": { "$in": statuses_bson(from)? },
        };

        let mut set = doc! { "updatedAt": Utc::now() };
        let mut unset = Document::new();
        if let Some(to) = transition.to {
            set.insert("status", enum_bson(&to)?);
        }
        match transition.paused_reason {
            Some(Some(reason)) => {
                set.insert("pausedReason", enum_bson(&reason)?);
            }
            Some(None) => {
                unset.insert("pausedReason", "");
            }
            None => {}
        }
        if let Some(at) = transition.started_at {
            set.insert("startedAt", at);
        }
        if let Some(at) = transition.paused_at {
            set.insert("pausedAt", at);
        }
        if let Some(at) = transition.completed_at {
            set.insert("completedAt", at);
        }

        let mut update = doc! { "$set": set };
        if !unset.is_empty() {
            update.insert("$unset", unset);
        }
        if let Some(entry) = transition.audit {
            update.insert(
                "$push",
                doc! { "audit": {
                    "$each": [bson::to_bson(&entry)?],
                    "$slice": -(AUDIT_TRAIL_CAP as i64),
                } },
            );
        }

        let result = self.collection.update_one(filter, update).await?;
        Ok(result.modified_count > 0)
    }

    async fn increment_totals(&self, id: &str, delta: TotalsDelta) -> Result<()> {
        if delta.is_zero() {
            return Ok(());
        }
        let mut inc = Document::new();
        for (field, value) in [
            ("totals.queued", delta.queued),
            ("totals.sent", delta.sent),
            ("totals.delivered", delta.delivered),
            ("totals.read", delta.read),
            ("totals.failed", delta.failed),
            ("totals.replied", delta.replied),
        ] {
            if value != 0 {
                inc.insert(field, value);
            }
        }
        self.collection
            .update_one(doc! { "_id": id }, doc! { "$inc": inc })
            .await?;
        Ok(())
    }

    async fn set_outcome_totals(
        &self,
        id: &str,
        sent: u64,
        failed: u64,
        queued: u64,
    ) -> Result<()> {
        self.collection
            .update_one(
                doc! { "_id": id },
                doc! { "$set": {
                    "totals.sent": sent as i64,
                    "totals.failed": failed as i64,
                    "totals.queued": queued as i64,
                    "updatedAt": Utc::now(),
                } },
            )
            .await?;
        Ok(())
    }

    async fn set_batching_plan(
        &self,
        id: &str,
        total_recipients: u64,
        batch_size: u32,
        total_batches: u32,
    ) -> Result<()> {
        self.collection
            .update_one(
                doc! { "_id": id },
                doc! { "$set": {
                    "totals.totalRecipients": total_recipients as i64,
                    "totals.queued": total_recipients as i64,
                    "batching.batchSize": batch_size,
                    "batching.totalBatches": total_batches,
                    "updatedAt": Utc::now(),
                } },
            )
            .await?;
        Ok(())
    }

    async fn increment_completed_batches(&self, id: &str) -> Result<()> {
        self.collection
            .update_one(
                doc! { "_id": id },
                doc! { "$inc": { "batching.completedBatches": 1 } },
            )
            .await?;
        Ok(())
    }

    async fn increment_failed_batches(&self, id: &str) -> Result<()> {
        self.collection
            .update_one(
                doc! { "_id": id },
                doc! { "$inc": { "batching.failedBatches": 1 } },
            )
            .await?;
        Ok(())
    }

    async fn record_send_failure(
        &self,
        id: &str,
        error: &str,
        provider_code: Option<i64>,
    ) -> Result<()> {
        let mut update = doc! {
            "$inc": { "failure.consecutiveFailures": 1 },
            "$set": {
                "failure.lastError": error,
                "failure.lastFailureAt": Utc::now(),
            },
        };
        if let Some(code) = provider_code {
            update.insert(
                "$push",
                doc! { "failure.lastErrorCodes": { "$each": [code], "$slice": -10 } },
            );
        }
        self.collection
            .update_one(doc! { "_id": id }, update)
            .await?;
        Ok(())
    }

    async fn clear_consecutive_failures(&self, id: &str) -> Result<()> {
        self.collection
            .update_one(
                doc! { "_id": id, "failure.consecutiveFailures": { "$gt": 0 } },
                doc! { "$set": { "failure.consecutiveFailures": 0 } },
            )
            .await?;
        Ok(())
    }

    async fn push_audit(&self, id: &str, entry: AuditEntry) -> Result<()> {
        self.collection
            .update_one(
                doc! { "_id": id },
                doc! { "$push": { "audit": {
                    "$each": [bson::to_bson(&entry)?],
                    "$slice": -(AUDIT_TRAIL_CAP as i64),
                } } },
            )
            .await?;
        Ok(())
    }

    async fn list_running_by_template(&self, template_id: &str) -> Result<Vec<Campaign>> {
        let cursor = self
            .collection
            .find(doc! { "status": "RUNNING", "template.templateId": template_id })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn list_running_by_tenant(&self, tenant_id: &str) -> Result<Vec<Campaign>> {
        let cursor = self
            .collection
            .find(doc! { "status": "RUNNING", "tenantId": tenant_id })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Campaign>> {
        let cursor = self.collection.find(doc! { "tenantId": tenant_id }).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn find_due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        let cursor = self
            .collection
            .find(doc! { "status": "SCHEDULED", "scheduledAt": { "$lte": now } })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = self.collection.delete_one(doc! { "_id": id }).await?;
        Ok(result.deleted_count > 0)
    }

    async fn delete_all_for_tenant(&self, tenant_id: &str) -> Result<u64> {
        let result = self
            .collection
            .delete_many(doc! { "tenantId": tenant_id })
            .await?;
        Ok(result.deleted_count)
    }
}

// ============================================================================
// Campaign batches
// ============================================================================

pub struct MongoBatchRepository {
    collection: Collection<CampaignBatch>,
}

impl MongoBatchRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("campaign_batches"),
        }
    }

    async fn count_status(&self, campaign_id: &str, status: BatchStatus) -> Result<u64> {
        Ok(self
            .collection
            .count_documents(doc! { "campaignId": campaign_id, "status": enum_bson(&status)? })
            .await?)
    }
}

#[async_trait]
impl BatchRepository for MongoBatchRepository {
    async fn insert_many(&self, batches: &[CampaignBatch]) -> Result<()> {
        if batches.is_empty() {
            return Ok(());
        }
        self.collection.insert_many(batches).await?;
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<CampaignBatch>> {
        Ok(self.collection.find_one(doc! { "_id": id }).await?)
    }

    async fn find_by_campaign(&self, campaign_id: &str) -> Result<Vec<CampaignBatch>> {
        let cursor = self
            .collection
            .find(doc! { "campaignId": campaign_id })
            .sort(doc! { "index": 1 })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn try_transition(
        &self,
        id: &str,
        from: &[BatchStatus],
        to: BatchStatus,
    ) -> Result<bool> {
        // Batch finality: COMPLETED can never be a transition source.
        let from: Vec<BatchStatus> = from
            .iter()
            .copied()
            .filter(|s| !s.is_final())
            .collect();
        if from.is_empty() {
            return Ok(false);
        }
        let result = self
            .collection
            .update_one(
                doc! { "_id": id, "status": { "$in": statuses_bson(&from)? } },
                doc! { "$set": { "status": enum_bson(&to)?, "updatedAt": Utc::now() } },
            )
            .await?;
        Ok(result.modified_count > 0)
    }

    async fn mark_processing(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": id, "status": { "$in": ["PENDING", "QUEUED", "FAILED"] } },
                doc! {
                    "$set": {
                        "status": "PROCESSING",
                        "processingStartedAt": at,
                        "updatedAt": at,
                    },
                    "$inc": { "attempts": 1 },
                },
            )
            .await?;
        Ok(result.modified_count > 0)
    }

    async fn reclaim_stale_processing(
        &self,
        id: &str,
        cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! {
                    "_id": id,
                    "status": "PROCESSING",
                    "processingStartedAt": { "$lt": cutoff },
                },
                doc! {
                    "$set": { "processingStartedAt": at, "updatedAt": at },
                    "$inc": { "attempts": 1 },
                },
            )
            .await?;
        Ok(result.modified_count > 0)
    }

    async fn mark_completed(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": id, "status": "PROCESSING" },
                doc! { "$set": {
                    "status": "COMPLETED",
                    "completedAt": at,
                    "updatedAt": at,
                } },
            )
            .await?;
        Ok(result.modified_count > 0)
    }

    async fn update_recipient(
        &self,
        batch_id: &str,
        contact_id: &str,
        update: RecipientUpdate,
    ) -> Result<bool> {
        let mut set = doc! {
            "recipients.$.status": enum_bson(&update.status)?,
            "recipients.$.processedAt": update.processed_at,
            "updatedAt": Utc::now(),
        };
        if let Some(id) = update.provider_message_id {
            set.insert("recipients.$.providerMessageId", id);
        }
        if let Some(error) = update.error {
            set.insert("recipients.$.error", error);
        }
        let result = self
            .collection
            .update_one(
                doc! { "_id": batch_id, "recipients.contactId": contact_id },
                doc! { "$set": set },
            )
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn pause_nonfinal(&self, campaign_id: &str) -> Result<u64> {
        let result = self
            .collection
            .update_many(
                doc! {
                    "campaignId": campaign_id,
                    "status": { "$in": ["PENDING", "QUEUED"] },
                },
                doc! { "$set": { "status": "PAUSED", "updatedAt": Utc::now() } },
            )
            .await?;
        Ok(result.modified_count)
    }

    async fn find_resumable(&self, campaign_id: &str) -> Result<Vec<CampaignBatch>> {
        let cursor = self
            .collection
            .find(doc! {
                "campaignId": campaign_id,
                "status": { "$in": ["PENDING", "FAILED", "PAUSED"] },
            })
            .sort(doc! { "index": 1 })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn counts_by_status(&self, campaign_id: &str) -> Result<BatchStatusCounts> {
        Ok(BatchStatusCounts {
            pending: self.count_status(campaign_id, BatchStatus::Pending).await? as u32,
            queued: self.count_status(campaign_id, BatchStatus::Queued).await? as u32,
            processing: self.count_status(campaign_id, BatchStatus::Processing).await? as u32,
            completed: self.count_status(campaign_id, BatchStatus::Completed).await? as u32,
            failed: self.count_status(campaign_id, BatchStatus::Failed).await? as u32,
            paused: self.count_status(campaign_id, BatchStatus::Paused).await? as u32,
        })
    }

    async fn recipient_outcome_counts(&self, campaign_id: &str) -> Result<(u64, u64)> {
        let batches = self.find_by_campaign(campaign_id).await?;
        let mut sent = 0u64;
        let mut failed = 0u64;
        for batch in &batches {
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
        let cursor = self
            .collection
            .find(doc! {
                "status": "PROCESSING",
                "processingStartedAt": { "$lt": cutoff },
            })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn delete_all_for_campaign(&self, campaign_id: &str) -> Result<u64> {
        let result = self
            .collection
            .delete_many(doc! { "campaignId": campaign_id })
            .await?;
        Ok(result.deleted_count)
    }
}

// ============================================================================
// Campaign messages
// ============================================================================

pub struct MongoCampaignMessageRepository {
    collection: Collection<CampaignMessage>,
}

impl MongoCampaignMessageRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("campaign_messages"),
        }
    }
}

#[async_trait]
impl CampaignMessageRepository for MongoCampaignMessageRepository {
    async fn upsert_send_outcome(
        &self,
        campaign_id: &str,
        contact_id: &str,
        tenant_id: &str,
        status: MessageStatus,
        provider_message_id: Option<String>,
        error: Option<String>,
    ) -> Result<CampaignMessage> {
        let now = Utc::now();
        let mut set = doc! {
            "status": enum_bson(&status)?,
            "updatedAt": now,
        };
        match status {
            MessageStatus::Sent => {
                set.insert("sentAt", now);
            }
            MessageStatus::Failed => {
                set.insert("failedAt", now);
            }
            _ => {}
        }
        if let Some(id) = provider_message_id {
            set.insert("providerMessageId", id);
        }
        if let Some(error) = error {
            set.insert("lastError", error);
        }

        self.collection
            .update_one(
                doc! { "campaignId": campaign_id, "contactId": contact_id },
                doc! {
                    "$set": set,
                    "$inc": { "attemptCount": 1 },
                    "$setOnInsert": {
                        "_id": uuid::Uuid::new_v4().to_string(),
                        "tenantId": tenant_id,
                        "createdAt": now,
                    },
                },
            )
            .upsert(true)
            .await?;

        self.find(campaign_id, contact_id)
            .await?
            .ok_or_else(|| StoreError::not_found("CampaignMessage", contact_id))
    }

    async fn find(
        &self,
        campaign_id: &str,
        contact_id: &str,
    ) -> Result<Option<CampaignMessage>> {
        Ok(self
            .collection
            .find_one(doc! { "campaignId": campaign_id, "contactId": contact_id })
            .await?)
    }

    async fn apply_advance(
        &self,
        id: &str,
        expected_current: MessageStatus,
        outcome: &AdvanceOutcome,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut set = doc! {
            "status": enum_bson(&outcome.new_status)?,
            "updatedAt": at,
        };
        for reached in &outcome.reached {
            match reached {
                MessageStatus::Sent => set.insert("sentAt", at),
                MessageStatus::Delivered => set.insert("deliveredAt", at),
                MessageStatus::Read => set.insert("readAt", at),
                MessageStatus::Failed => set.insert("failedAt", at),
                _ => None,
            };
        }
        let result = self
            .collection
            .update_one(
                doc! { "_id": id, "status": enum_bson(&expected_current)? },
                doc! { "$set": set },
            )
            .await?;
        Ok(result.modified_count > 0)
    }

    async fn mark_replied(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": id, "repliedAt": { "$exists": false } },
                doc! { "$set": { "repliedAt": at, "updatedAt": at } },
            )
            .await?;
        Ok(result.modified_count > 0)
    }

    async fn count_queued(&self, campaign_id: &str) -> Result<u64> {
        Ok(self
            .collection
            .count_documents(doc! {
                "campaignId": campaign_id,
                "status": { "$in": ["QUEUED", "SENDING"] },
            })
            .await?)
    }

    async fn find_latest_for_contact(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Option<CampaignMessage>> {
        Ok(self
            .collection
            .find_one(doc! { "tenantId": tenant_id, "contactId": contact_id })
            .sort(doc! { "updatedAt": -1 })
            .await?)
    }

    async fn delete_all_for_campaign(&self, campaign_id: &str) -> Result<u64> {
        let result = self
            .collection
            .delete_many(doc! { "campaignId": campaign_id })
            .await?;
        Ok(result.deleted_count)
    }
}

// ============================================================================
// Messages
// ============================================================================

pub struct MongoMessageRepository {
    collection: Collection<Message>,
}

impl MongoMessageRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("messages"),
        }
    }
}

#[async_trait]
impl MessageRepository for MongoMessageRepository {
    async fn insert(&self, message: &Message) -> Result<()> {
        self.collection.insert_one(message).await?;
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Message>> {
        Ok(self.collection.find_one(doc! { "_id": id }).await?)
    }

    async fn find_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<Message>> {
        Ok(self
            .collection
            .find_one(doc! { "providerMessageId": provider_message_id })
            .await?)
    }

    async fn apply_advance(
        &self,
        id: &str,
        expected_current: MessageStatus,
        outcome: &AdvanceOutcome,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<bool> {
        let mut set = doc! {
            "status": enum_bson(&outcome.new_status)?,
        };
        for reached in &outcome.reached {
            match reached {
                MessageStatus::Sent => set.insert("sentAt", at),
                MessageStatus::Delivered => set.insert("deliveredAt", at),
                MessageStatus::Read => set.insert("readAt", at),
                MessageStatus::Failed => set.insert("failedAt", at),
                _ => None,
            };
        }
        if let Some(error) = error {
            set.insert("lastError", error);
        }
        let result = self
            .collection
            .update_one(
                doc! { "_id": id, "status": enum_bson(&expected_current)? },
                doc! { "$set": set },
            )
            .await?;
        Ok(result.modified_count > 0)
    }

    async fn list_for_campaign(&self, campaign_id: &str, limit: i64) -> Result<Vec<Message>> {
        let cursor = self
            .collection
            .find(doc! { "attribution.campaignId": campaign_id })
            .sort(doc! { "createdAt": -1 })
            .limit(limit)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn delete_all_for_tenant(&self, tenant_id: &str) -> Result<u64> {
        let result = self
            .collection
            .delete_many(doc! { "tenantId": tenant_id })
            .await?;
        Ok(result.deleted_count)
    }
}

// ============================================================================
// Conversations
// ============================================================================

pub struct MongoConversationRepository {
    collection: Collection<Conversation>,
    ledger: Collection<ConversationLedgerEntry>,
}

impl MongoConversationRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("conversations"),
            ledger: db.collection("conversation_ledger"),
        }
    }
}

#[async_trait]
impl ConversationRepository for MongoConversationRepository {
    async fn ensure_open(&self, tenant_id: &str, contact_id: &str) -> Result<Conversation> {
        if let Some(existing) = self.find_for_contact(tenant_id, contact_id).await? {
            return Ok(existing);
        }
        let conversation = Conversation::new(tenant_id, contact_id);
        self.collection.insert_one(&conversation).await?;
        Ok(conversation)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Conversation>> {
        Ok(self.collection.find_one(doc! { "_id": id }).await?)
    }

    async fn find_for_contact(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Option<Conversation>> {
        Ok(self
            .collection
            .find_one(doc! {
                "tenantId": tenant_id,
                "contactId": contact_id,
                "status": "OPEN",
            })
            .await?)
    }

    async fn touch_customer_message(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        // $max keeps the anchor monotonic under out-of-order ingestion.
        let result = self
            .collection
            .update_one(
                doc! { "_id": id },
                doc! {
                    "$max": { "lastCustomerMessageAt": at },
                    "$set": { "updatedAt": Utc::now() },
                },
            )
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn increment_unread(&self, id: &str) -> Result<()> {
        self.collection
            .update_one(doc! { "_id": id }, doc! { "$inc": { "unreadCount": 1 } })
            .await?;
        Ok(())
    }

    async fn set_assignee(&self, id: &str, assignee: Option<String>) -> Result<bool> {
        let update = match assignee {
            Some(assignee) => doc! { "$set": { "assignee": assignee, "updatedAt": Utc::now() } },
            None => doc! {
                "$unset": { "assignee": "" },
                "$set": { "updatedAt": Utc::now() },
            },
        };
        let result = self
            .collection
            .update_one(doc! { "_id": id }, update)
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn set_status(&self, id: &str, status: ConversationStatus) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { "status": enum_bson(&status)?, "updatedAt": Utc::now() } },
            )
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn add_tag(&self, id: &str, tag: &str) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": id },
                doc! { "$addToSet": { "tags": tag }, "$set": { "updatedAt": Utc::now() } },
            )
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn remove_tag(&self, id: &str, tag: &str) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": id },
                doc! { "$pull": { "tags": tag }, "$set": { "updatedAt": Utc::now() } },
            )
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn add_note(&self, id: &str, note: ConversationNote) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": id },
                doc! {
                    "$push": { "notes": bson::to_bson(&note)? },
                    "$set": { "updatedAt": Utc::now() },
                },
            )
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn count_open_by_assignee(&self, tenant_id: &str, assignee: &str) -> Result<u64> {
        Ok(self
            .collection
            .count_documents(doc! {
                "tenantId": tenant_id,
                "assignee": assignee,
                "status": "OPEN",
            })
            .await?)
    }

    async fn insert_ledger_entry(&self, entry: &ConversationLedgerEntry) -> Result<()> {
        self.ledger.insert_one(entry).await?;
        Ok(())
    }

    async fn delete_all_for_tenant(&self, tenant_id: &str) -> Result<u64> {
        self.ledger
            .delete_many(doc! { "tenantId": tenant_id })
            .await?;
        let result = self
            .collection
            .delete_many(doc! { "tenantId": tenant_id })
            .await?;
        Ok(result.deleted_count)
    }
}

// ============================================================================
// Automation rules
// ============================================================================

pub struct MongoAutomationRuleRepository {
    collection: Collection<AutomationRule>,
}

impl MongoAutomationRuleRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("automation_rules"),
        }
    }
}

#[async_trait]
impl AutomationRuleRepository for MongoAutomationRuleRepository {
    async fn insert(&self, rule: &AutomationRule) -> Result<()> {
        self.collection.insert_one(rule).await?;
        Ok(())
    }

    async fn find_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<AutomationRule>> {
        Ok(self
            .collection
            .find_one(doc! { "_id": id, "tenantId": tenant_id })
            .await?)
    }

    async fn list_enabled_by_trigger(
        &self,
        tenant_id: &str,
        trigger: TriggerKind,
    ) -> Result<Vec<AutomationRule>> {
        let cursor = self
            .collection
            .find(doc! {
                "tenantId": tenant_id,
                "trigger": enum_bson(&trigger)?,
                "enabled": true,
            })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn record_execution(
        &self,
        id: &str,
        success: bool,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let dk = day_key(at);
        // Reset the day window if it rolled over since the last execution.
        self.collection
            .update_one(
                doc! { "_id": id, "executionsDayKey": { "$ne": &dk } },
                doc! { "$set": { "executionsDayKey": &dk, "executionsToday": 0i64 } },
            )
            .await?;

        let mut inc = doc! { "executionsToday": 1i64 };
        inc.insert(if success { "successCount" } else { "failureCount" }, 1i64);
        let mut set = doc! { "updatedAt": at };
        if let Some(error) = error {
            set.insert("lastError", error);
        }
        self.collection
            .update_one(doc! { "_id": id }, doc! { "$inc": inc, "$set": set })
            .await?;
        Ok(())
    }

    async fn set_enabled(&self, tenant_id: &str, id: &str, enabled: bool) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": id, "tenantId": tenant_id },
                doc! { "$set": { "enabled": enabled, "updatedAt": Utc::now() } },
            )
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn delete_all_for_tenant(&self, tenant_id: &str) -> Result<u64> {
        let result = self
            .collection
            .delete_many(doc! { "tenantId": tenant_id })
            .await?;
        Ok(result.deleted_count)
    }
}

// ============================================================================
// Webhook log
// ============================================================================

pub struct MongoWebhookLogRepository {
    collection: Collection<WebhookLog>,
}

impl MongoWebhookLogRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("webhook_logs"),
        }
    }
}

#[async_trait]
impl WebhookLogRepository for MongoWebhookLogRepository {
    async fn insert(&self, log: &WebhookLog) -> Result<()> {
        self.collection.insert_one(log).await?;
        Ok(())
    }

    async fn set_outcome(
        &self,
        id: &str,
        tenant_id: Option<String>,
        outcome: WebhookOutcome,
        error: Option<String>,
    ) -> Result<()> {
        let mut set = doc! { "outcome": enum_bson(&outcome)? };
        if let Some(tenant_id) = tenant_id {
            set.insert("tenantId", tenant_id);
        }
        if let Some(error) = error {
            set.insert("error", error);
        }
        self.collection
            .update_one(doc! { "_id": id }, doc! { "$set": set })
            .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<WebhookLog>> {
        Ok(self.collection.find_one(doc! { "_id": id }).await?)
    }
}
