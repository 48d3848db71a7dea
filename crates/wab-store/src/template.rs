//! Message Template Entity
//!
//! Templates are tenant-scoped and name-unique per tenant. Approval state is
//! authoritative at the provider; locally it changes only via webhook or an
//! explicit sync. Only APPROVED templates are sendable.

use async_trait::async_trait;
use bson::serde_helpers::chrono_datetime_as_bson_datetime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemplateCategory {
    Marketing,
    Utility,
    Authentication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemplateStatus {
    Draft,
    Pending,
    Approved,
    Rejected,
    Paused,
    Revoked,
}

impl TemplateStatus {
    pub fn is_sendable(&self) -> bool {
        matches!(self, TemplateStatus::Approved)
    }

    /// Parse the provider's template-status webhook vocabulary.
    pub fn from_provider_event(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "APPROVED" => Some(TemplateStatus::Approved),
            "REJECTED" => Some(TemplateStatus::Rejected),
            "PAUSED" => Some(TemplateStatus::Paused),
            "DISABLED" | "REVOKED" => Some(TemplateStatus::Revoked),
            "PENDING" | "IN_APPEAL" => Some(TemplateStatus::Pending),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeaderFormat {
    Text,
    Image,
    Video,
    Document,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateHeader {
    pub format: HeaderFormat,
    /// Text headers may carry a single `{{1}}` variable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ButtonKind {
    QuickReply,
    Url,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateButton {
    pub kind: ButtonKind,
    pub text: String,
    /// URL buttons may carry a trailing `{{1}}` variable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    #[serde(rename = "_id")]
    pub id: String,

    pub tenant_id: String,

    /// Tenant-unique template name, as registered at the provider.
    pub name: String,

    /// BCP-47-ish provider language code (`en_US`, `pt_BR`, ...).
    pub language: String,

    pub category: TemplateCategory,

    pub status: TemplateStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<TemplateHeader>,

    /// Body text with positional variables `{{1}}..{{N}}`.
    pub body: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<String>,

    #[serde(default)]
    pub buttons: Vec<TemplateButton>,

    /// Provider-side template id once registered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_template_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

/// Count positional `{{N}}` variables in a template region; the arity is the
/// highest index referenced, so `{{2}}` alone still declares two slots.
pub fn variable_count(text: &str) -> u32 {
    let mut max = 0u32;
    let bytes = text.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'{' && bytes[i + 1] == b'{' {
            let rest = &text[i + 2..];
            if let Some(end) = rest.find("}}") {
                if let Ok(n) = rest[..end].trim().parse::<u32>() {
                    max = max.max(n);
                }
                i += 2 + end + 2;
                continue;
            }
        }
        i += 1;
    }
    max
}

impl Template {
    pub fn body_variable_count(&self) -> u32 {
        variable_count(&self.body)
    }

    pub fn header_variable_count(&self) -> u32 {
        match &self.header {
            Some(h) if h.format == HeaderFormat::Text => {
                h.text.as_deref().map(variable_count).unwrap_or(0)
            }
            // Media headers take exactly one link parameter.
            Some(_) => 1,
            None => 0,
        }
    }

    /// Per-button variable arity, index-aligned with `buttons`.
    pub fn button_variable_counts(&self) -> Vec<u32> {
        self.buttons
            .iter()
            .map(|b| match b.kind {
                ButtonKind::Url => b.url.as_deref().map(variable_count).unwrap_or(0),
                ButtonKind::QuickReply => 0,
            })
            .collect()
    }

    pub fn is_sendable(&self) -> bool {
        self.status.is_sendable()
    }
}

#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn insert(&self, template: &Template) -> Result<()>;

    async fn find_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<Template>>;

    /// Lookup ignoring tenant scope; the caller verifies ownership and maps a
    /// mismatch to its own error kind.
    async fn find_any_by_id(&self, id: &str) -> Result<Option<Template>>;

    async fn find_by_name(
        &self,
        tenant_id: &str,
        name: &str,
        language: Option<&str>,
    ) -> Result<Option<Template>>;

    async fn update(&self, template: &Template) -> Result<()>;

    async fn set_status(
        &self,
        id: &str,
        status: TemplateStatus,
        reason: Option<String>,
    ) -> Result<bool>;

    /// All APPROVED templates of a tenant (the list-sendable surface).
    async fn list_sendable(&self, tenant_id: &str) -> Result<Vec<Template>>;

    async fn delete_all_for_tenant(&self, tenant_id: &str) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(body: &str) -> Template {
        let now = Utc::now();
        Template {
            id: "tpl1".into(),
            tenant_id: "t1".into(),
            name: "order_update".into(),
            language: "en_US".into(),
            category: TemplateCategory::Utility,
            status: TemplateStatus::Approved,
            header: None,
            body: body.into(),
            footer: None,
            buttons: Vec::new(),
            provider_template_id: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn counts_positional_variables() {
        assert_eq!(variable_count("no vars"), 0);
        assert_eq!(variable_count("hi {{1}}"), 1);
        assert_eq!(variable_count("{{1}} and {{2}} and {{1}}"), 2);
        // Highest index wins even when lower slots are unreferenced.
        assert_eq!(variable_count("only {{3}}"), 3);
        assert_eq!(variable_count("broken {{x}}"), 0);
    }

    #[test]
    fn header_arity_by_format() {
        let mut t = template("hello {{1}}");
        assert_eq!(t.header_variable_count(), 0);

        t.header = Some(TemplateHeader {
            format: HeaderFormat::Text,
            text: Some("Order {{1}}".into()),
        });
        assert_eq!(t.header_variable_count(), 1);

        t.header = Some(TemplateHeader {
            format: HeaderFormat::Image,
            text: None,
        });
        assert_eq!(t.header_variable_count(), 1);
    }

    #[test]
    fn url_buttons_declare_their_own_arity() {
        let mut t = template("body");
        t.buttons = vec![
            TemplateButton {
                kind: ButtonKind::QuickReply,
                text: "Stop".into(),
                url: None,
            },
            TemplateButton {
                kind: ButtonKind::Url,
                text: "Track".into(),
                url: Some("https://example.com/track/{{1}}".into()),
            },
        ];
        assert_eq!(t.button_variable_counts(), vec![0, 1]);
    }

    #[test]
    fn only_approved_is_sendable() {
        let mut t = template("body");
        assert!(t.is_sendable());
        t.status = TemplateStatus::Paused;
        assert!(!t.is_sendable());
        t.status = TemplateStatus::Rejected;
        assert!(!t.is_sendable());
    }

    #[test]
    fn provider_event_vocabulary() {
        assert_eq!(
            TemplateStatus::from_provider_event("REJECTED"),
            Some(TemplateStatus::Rejected)
        );
        assert_eq!(
            TemplateStatus::from_provider_event("disabled"),
            Some(TemplateStatus::Revoked)
        );
        assert_eq!(TemplateStatus::from_provider_event("???"), None);
    }
}
