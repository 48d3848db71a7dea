//! WaBridge Persistence Layer
//!
//! Entities and repository traits for the campaign data model, with two
//! backends: MongoDB for production and an in-memory store for development
//! and tests. Cross-worker coordination uses atomic `$inc`-style counter
//! updates and conditional status transitions; entity instances are plain
//! data with no hidden save methods.

use std::sync::Arc;

pub mod automation_rule;
pub mod batch;
pub mod campaign;
pub mod campaign_message;
pub mod contact;
pub mod conversation;
pub mod error;
pub mod memory;
pub mod message;
pub mod mongo;
pub mod template;
pub mod webhook_log;
pub mod workspace;

pub use automation_rule::{
    ActionStep, AssignStrategy, AutomationRule, AutomationRuleRepository, KeywordMatchMode,
    MediaKind, RuleAction, RuleCondition, TriggerKind, MAX_INLINE_DELAY_SECONDS,
};
pub use batch::{
    BatchRecipient, BatchRepository, BatchStatus, BatchStatusCounts, CampaignBatch,
    RecipientStatus, RecipientUpdate,
};
pub use campaign::{
    AuditAction, AuditEntry, BatchingPlan, Campaign, CampaignRepository, CampaignStatus,
    CampaignTotals, CampaignTransition, FailureTracking, PauseReason, TemplateSnapshot,
    TotalsDelta, DEFAULT_BATCH_SIZE,
};
pub use campaign_message::{CampaignMessage, CampaignMessageRepository};
pub use contact::{Contact, ContactRepository, CustomField, FieldValue, RecipientSpec};
pub use conversation::{
    Conversation, ConversationLedgerEntry, ConversationNote, ConversationRepository,
    ConversationStatus, SessionOrigin, SESSION_WINDOW_HOURS,
};
pub use error::{Result, StoreError};
pub use message::{
    advance_plan, AdvanceOutcome, Attribution, Direction, Message, MessageKind,
    MessageRepository, MessageStatus,
};
pub use template::{
    variable_count, ButtonKind, HeaderFormat, Template, TemplateButton, TemplateCategory,
    TemplateHeader, TemplateRepository, TemplateStatus,
};
pub use webhook_log::{WebhookLog, WebhookLogRepository, WebhookOutcome};
pub use workspace::{
    day_key, month_key, BspCredentials, PhoneStatus, PlanLimitOverrides, SafetyStatus,
    UsageCounters, Workspace, WorkspaceRepository,
};

/// Bundle of repository handles injected into every subsystem at boot.
#[derive(Clone)]
pub struct Store {
    pub workspaces: Arc<dyn WorkspaceRepository>,
    pub contacts: Arc<dyn ContactRepository>,
    pub templates: Arc<dyn TemplateRepository>,
    pub campaigns: Arc<dyn CampaignRepository>,
    pub batches: Arc<dyn BatchRepository>,
    pub campaign_messages: Arc<dyn CampaignMessageRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub automation_rules: Arc<dyn AutomationRuleRepository>,
    pub webhook_logs: Arc<dyn WebhookLogRepository>,
}

impl Store {
    pub fn mongo(db: &mongodb::Database) -> Self {
        Self {
            workspaces: Arc::new(mongo::MongoWorkspaceRepository::new(db)),
            contacts: Arc::new(mongo::MongoContactRepository::new(db)),
            templates: Arc::new(mongo::MongoTemplateRepository::new(db)),
            campaigns: Arc::new(mongo::MongoCampaignRepository::new(db)),
            batches: Arc::new(mongo::MongoBatchRepository::new(db)),
            campaign_messages: Arc::new(mongo::MongoCampaignMessageRepository::new(db)),
            messages: Arc::new(mongo::MongoMessageRepository::new(db)),
            conversations: Arc::new(mongo::MongoConversationRepository::new(db)),
            automation_rules: Arc::new(mongo::MongoAutomationRuleRepository::new(db)),
            webhook_logs: Arc::new(mongo::MongoWebhookLogRepository::new(db)),
        }
    }

    /// In-memory backend for development mode and tests.
    pub fn memory() -> Self {
        Self {
            workspaces: Arc::new(memory::MemoryWorkspaceRepository::default()),
            contacts: Arc::new(memory::MemoryContactRepository::default()),
            templates: Arc::new(memory::MemoryTemplateRepository::default()),
            campaigns: Arc::new(memory::MemoryCampaignRepository::default()),
            batches: Arc::new(memory::MemoryBatchRepository::default()),
            campaign_messages: Arc::new(memory::MemoryCampaignMessageRepository::default()),
            messages: Arc::new(memory::MemoryMessageRepository::default()),
            conversations: Arc::new(memory::MemoryConversationRepository::default()),
            automation_rules: Arc::new(memory::MemoryAutomationRuleRepository::default()),
            webhook_logs: Arc::new(memory::MemoryWebhookLogRepository::default()),
        }
    }

    /// Best-effort cascade across all tenant-scoped collections. Campaign
    /// children go first so batches and join records are never orphaned.
    pub async fn purge_tenant(&self, tenant_id: &str) -> Result<()> {
        let campaigns = self.campaigns.list_by_tenant(tenant_id).await?;
        for campaign in &campaigns {
            self.batches.delete_all_for_campaign(&campaign.id).await?;
            self.campaign_messages
                .delete_all_for_campaign(&campaign.id)
                .await?;
        }
        self.campaigns.delete_all_for_tenant(tenant_id).await?;
        self.contacts.delete_all_for_tenant(tenant_id).await?;
        self.templates.delete_all_for_tenant(tenant_id).await?;
        self.messages.delete_all_for_tenant(tenant_id).await?;
        self.conversations.delete_all_for_tenant(tenant_id).await?;
        self.automation_rules.delete_all_for_tenant(tenant_id).await?;
        self.workspaces.delete(tenant_id).await?;
        Ok(())
    }
}
