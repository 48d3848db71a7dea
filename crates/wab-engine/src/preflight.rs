//! Preflight Validator
//!
//! Static and dynamic checks run before a campaign is enqueued. Errors
//! block; warnings are informational. The checks run in a fixed order so
//! the report reads the same way every time: template, recipients, account
//! health, phone tier, workspace limits, estimates.

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::error::Result;
use crate::Platform;
use wab_common::QualityRating;
use wab_store::{
    Campaign, ContactRepository, TemplateRepository, TemplateStatus, Workspace,
    WorkspaceRepository,
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightIssue {
    pub code: String,
    pub message: String,
}

impl PreflightIssue {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightEstimates {
    pub recipient_count: u64,
    pub batch_count: u32,
    pub estimated_duration_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightReport {
    pub valid: bool,
    pub errors: Vec<PreflightIssue>,
    pub warnings: Vec<PreflightIssue>,
    pub estimates: PreflightEstimates,
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            estimates: PreflightEstimates::default(),
            checks: Vec::new(),
        }
    }

    fn error(&mut self, code: &str, message: impl Into<String>) {
        self.valid = false;
        self.errors.push(PreflightIssue::new(code, message));
    }

    fn warn(&mut self, code: &str, message: impl Into<String>) {
        self.warnings.push(PreflightIssue::new(code, message));
    }

    fn check(&mut self, name: &str, passed: bool) {
        self.checks.push(CheckResult {
            name: name.to_string(),
            passed,
        });
    }
}

pub struct PreflightValidator {
    platform: Platform,
}

impl PreflightValidator {
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }

    /// The full pre-start validation.
    pub async fn validate(&self, campaign: &Campaign) -> Result<PreflightReport> {
        let mut report = PreflightReport::new();
        let now = Utc::now();

        // 1. Template
        let before = report.errors.len();
        match self
            .platform
            .store
            .templates
            .find_by_id(&campaign.tenant_id, &campaign.template.template_id)
            .await?
        {
            None => report.error(
                "TEMPLATE_NOT_FOUND",
                format!("template {} no longer exists", campaign.template.template_id),
            ),
            Some(template) if template.status != TemplateStatus::Approved => report.error(
                "TEMPLATE_NOT_APPROVED",
                format!(
                    "template {} is {:?}, only APPROVED templates are sendable",
                    template.name, template.status
                ),
            ),
            Some(_) => {}
        }
        report.check("template", report.errors.len() == before);

        // 2. Recipients
        let before = report.errors.len();
        let recipients = self
            .platform
            .store
            .contacts
            .resolve_recipients(&campaign.tenant_id, &campaign.recipients)
            .await?;
        let recipient_count = recipients.len() as u64;
        if recipient_count == 0 {
            report.error("NO_RECIPIENTS", "recipient set resolves to zero contacts");
        } else if recipient_count > self.platform.config.max_recipients {
            report.error(
                "TOO_MANY_RECIPIENTS",
                format!(
                    "{} recipients exceeds the {} maximum",
                    recipient_count, self.platform.config.max_recipients
                ),
            );
        }
        report.check("recipients", report.errors.len() == before);

        // 3. Account health
        let workspace = self
            .platform
            .store
            .workspaces
            .find_by_id(&campaign.tenant_id)
            .await?;
        let Some(workspace) = workspace else {
            report.error("WORKSPACE_NOT_CONFIGURED", "workspace does not exist");
            report.check("accountHealth", false);
            return Ok(report);
        };
        let before = report.errors.len();
        self.check_account_health(&mut report, &workspace);
        report.check("accountHealth", report.errors.len() == before);

        // 4. Phone tier & quality
        let before = report.errors.len();
        self.check_phone_tier(&mut report, &workspace, recipient_count);
        report.check("phoneTier", report.errors.len() == before);

        // 5. Workspace plan limits
        let before = report.errors.len();
        let daily_remaining = workspace.remaining_daily_quota(now);
        let monthly_remaining = workspace.remaining_monthly_quota(now);
        if let Some(remaining) = daily_remaining {
            if recipient_count > remaining {
                report.error(
                    "DAILY_LIMIT_EXCEEDED",
                    format!("{recipient_count} recipients exceed the {remaining} remaining daily quota"),
                );
            } else if remaining - recipient_count < recipient_count / 10 {
                report.warn(
                    "DAILY_QUOTA_TIGHT",
                    "less than 10% of the campaign size will remain of the daily quota",
                );
            }
        }
        if let Some(remaining) = monthly_remaining {
            if recipient_count > remaining {
                report.error(
                    "MONTHLY_LIMIT_EXCEEDED",
                    format!("{recipient_count} recipients exceed the {remaining} remaining monthly quota"),
                );
            }
        }
        report.check("workspaceLimits", report.errors.len() == before);

        // 6. Estimates
        let batch_size = campaign.batching.batch_size.max(1);
        report.estimates = PreflightEstimates {
            recipient_count,
            batch_count: recipient_count.div_ceil(batch_size as u64) as u32,
            estimated_duration_seconds: self.estimate_duration(recipient_count).as_secs(),
        };
        report.check("estimates", true);

        Ok(report)
    }

    /// The lighter subset re-run on resume: template, account health,
    /// quality/tier. Recipient and quota checks already bound the original
    /// start.
    pub async fn validate_resume(&self, campaign: &Campaign) -> Result<PreflightReport> {
        let mut report = PreflightReport::new();

        let before = report.errors.len();
        match self
            .platform
            .store
            .templates
            .find_by_id(&campaign.tenant_id, &campaign.template.template_id)
            .await?
        {
            None => report.error("TEMPLATE_NOT_FOUND", "template no longer exists"),
            Some(template) if !template.is_sendable() => {
                report.error("TEMPLATE_NOT_APPROVED", "template is no longer approved")
            }
            Some(_) => {}
        }
        report.check("template", report.errors.len() == before);

        let Some(workspace) = self
            .platform
            .store
            .workspaces
            .find_by_id(&campaign.tenant_id)
            .await?
        else {
            report.error("WORKSPACE_NOT_CONFIGURED", "workspace does not exist");
            report.check("accountHealth", false);
            return Ok(report);
        };

        let before = report.errors.len();
        self.check_account_health(&mut report, &workspace);
        report.check("accountHealth", report.errors.len() == before);

        let remaining = campaign
            .totals
            .total_recipients
            .saturating_sub(campaign.totals.processed());
        let before = report.errors.len();
        self.check_phone_tier(&mut report, &workspace, remaining);
        report.check("phoneTier", report.errors.len() == before);

        Ok(report)
    }

    fn check_account_health(&self, report: &mut PreflightReport, workspace: &Workspace) {
        let now = Utc::now();
        if workspace.blocked {
            report.error("ACCOUNT_BLOCKED", "account is blocked by the provider");
        }
        if workspace.capability_blocked {
            report.error("CAPABILITY_REVOKED", "messaging capability is revoked");
        }
        if workspace.token_expired(now) {
            report.error("TOKEN_EXPIRED", "access token is expired");
        } else if workspace.token_expires_within(now, ChronoDuration::hours(24)) {
            report.warn("TOKEN_EXPIRING", "access token expires within 24 hours");
        }
        if !workspace.is_bsp_connected(now) {
            report.error(
                "WORKSPACE_NOT_CONFIGURED",
                "workspace is not connected to the messaging provider",
            );
        }
    }

    fn check_phone_tier(
        &self,
        report: &mut PreflightReport,
        workspace: &Workspace,
        recipient_count: u64,
    ) {
        match workspace.quality_rating {
            QualityRating::Red => {
                report.error("QUALITY_RED", "phone quality rating is RED; sending is blocked")
            }
            QualityRating::Yellow => {
                report.warn("QUALITY_YELLOW", "phone quality rating is YELLOW")
            }
            _ => {}
        }

        if let Some(cap) = workspace.messaging_tier.daily_recipient_cap() {
            if recipient_count > cap {
                report.error(
                    "TIER_LIMIT_EXCEEDED",
                    format!(
                        "{recipient_count} recipients exceed the tier's 24-hour cap of {cap}"
                    ),
                );
            } else if recipient_count * 10 >= cap * 8 {
                report.warn(
                    "TIER_NEAR_CAP",
                    format!("campaign uses 80% or more of the tier's {cap} daily cap"),
                );
            }
        }
    }

    fn estimate_duration(&self, recipient_count: u64) -> Duration {
        let rate = self.platform.config.estimated_sends_per_second.max(0.1);
        Duration::from_secs_f64(recipient_count as f64 / rate)
    }
}
