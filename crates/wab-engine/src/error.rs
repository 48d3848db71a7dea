//! Engine Error Taxonomy
//!
//! Stable machine-readable kinds for every failure the campaign core can
//! surface. `kind()` is the wire-stable name; callers and the HTTP layer
//! switch on it, never on message text.

use thiserror::Error;

use crate::preflight::PreflightReport;
use wab_provider::{ErrorClass, ProviderError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Campaign not found: {0}")]
    CampaignNotFound(String),

    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Template {0} is not approved")]
    TemplateNotApproved(String),

    #[error("Template {template_id} does not belong to workspace {tenant_id}")]
    TemplateOwnershipMismatch {
        template_id: String,
        tenant_id: String,
    },

    #[error("{region} expects {expected} variables, got {actual}")]
    VariableCountMismatch {
        region: &'static str,
        expected: u32,
        actual: u32,
    },

    #[error("Workspace {0} has no messaging credentials")]
    WorkspaceNotConfigured(String),

    #[error("Workspace {0} has no phone number configured")]
    PhoneNotConfigured(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Campaign {campaign_id} is already running (lock held by {owner})")]
    CampaignAlreadyRunning { campaign_id: String, owner: String },

    #[error("Lock error: {0}")]
    Lock(#[from] wab_lock::LockError),

    #[error("Preflight failed with {} errors", report.errors.len())]
    PreflightFailed { report: PreflightReport },

    #[error("Kill switch is active: {0}")]
    KillSwitchActive(String),

    #[error("Workspace is unsafe to send from: {0}")]
    WorkspaceUnsafe(String),

    #[error("Invalid campaign status: expected {expected}, found {actual}")]
    InvalidStatus { expected: String, actual: String },

    #[error("Daily message limit exceeded")]
    DailyLimitExceeded,

    #[error("Monthly message limit exceeded")]
    MonthlyLimitExceeded,

    #[error("Messaging tier limit exceeded")]
    TierLimitExceeded,

    #[error("Quality rating is RED")]
    QualityRed,

    #[error("No open 24-hour session window")]
    No24hWindow,

    #[error("Store error: {0}")]
    Store(#[from] wab_store::StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] wab_queue::QueueError),

    #[error("Limits error: {0}")]
    Limits(#[from] wab_limits::LimitsError),
}

impl EngineError {
    /// Wire-stable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::CampaignNotFound(_) => "CAMPAIGN_NOT_FOUND",
            EngineError::WorkspaceNotFound(_) => "WORKSPACE_NOT_FOUND",
            EngineError::TemplateNotFound(_) => "TEMPLATE_NOT_FOUND",
            EngineError::TemplateNotApproved(_) => "TEMPLATE_NOT_APPROVED",
            EngineError::TemplateOwnershipMismatch { .. } => "TEMPLATE_OWNERSHIP_MISMATCH",
            EngineError::VariableCountMismatch { .. } => "VARIABLE_COUNT_MISMATCH",
            EngineError::WorkspaceNotConfigured(_) => "WORKSPACE_NOT_CONFIGURED",
            EngineError::PhoneNotConfigured(_) => "PHONE_NOT_CONFIGURED",
            EngineError::InvalidRecipient(_) => "INVALID_RECIPIENT",
            EngineError::Provider(_) => "META_API_ERROR",
            EngineError::CampaignAlreadyRunning { .. } => "CAMPAIGN_ALREADY_RUNNING",
            EngineError::Lock(_) => "LOCK_ERROR",
            EngineError::PreflightFailed { .. } => "PREFLIGHT_FAILED",
            EngineError::KillSwitchActive(_) => "KILL_SWITCH_ACTIVE",
            EngineError::WorkspaceUnsafe(_) => "WORKSPACE_UNSAFE",
            EngineError::InvalidStatus { .. } => "INVALID_STATUS",
            EngineError::DailyLimitExceeded => "DAILY_LIMIT_EXCEEDED",
            EngineError::MonthlyLimitExceeded => "MONTHLY_LIMIT_EXCEEDED",
            EngineError::TierLimitExceeded => "TIER_LIMIT_EXCEEDED",
            EngineError::QualityRed => "QUALITY_RED",
            EngineError::No24hWindow => "NO_24H_WINDOW",
            EngineError::Store(_) => "STORE_ERROR",
            EngineError::Queue(_) => "QUEUE_ERROR",
            EngineError::Limits(_) => "LIMITS_ERROR",
        }
    }

    /// Provider error class when this wraps an upstream failure.
    pub fn provider_class(&self) -> Option<ErrorClass> {
        match self {
            EngineError::Provider(e) => Some(e.class()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
