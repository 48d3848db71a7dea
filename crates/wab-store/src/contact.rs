//! Contact Entity
//!
//! Tenant-scoped address-book entry. Phone numbers are unique per tenant;
//! opted-out contacts are silently excluded from campaign recipient
//! resolution. Contact fields feed template variable mapping through the
//! field-path resolver.

use async_trait::async_trait;
use bson::serde_helpers::chrono_datetime_as_bson_datetime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomField {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    #[serde(rename = "_id")]
    pub id: String,

    pub tenant_id: String,

    /// E.164 digits without the leading `+`.
    pub phone: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Free-form profile attributes (`metadata.city`, ...).
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Ordered custom fields addressable as `custom.<key>`.
    #[serde(default)]
    pub custom_fields: Vec<CustomField>,

    #[serde(default)]
    pub opted_out: bool,

    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional"
    )]
    pub opted_out_at: Option<DateTime<Utc>>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

/// Result of resolving a field path against a contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    /// Path exists in no region of the record, or resolved to empty.
    Missing,
}

impl FieldValue {
    pub fn into_option(self) -> Option<String> {
        match self {
            FieldValue::Text(s) => Some(s),
            FieldValue::Missing => None,
        }
    }
}

impl Contact {
    pub fn new(tenant_id: impl Into<String>, phone: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            phone: phone.into(),
            name: None,
            email: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
            custom_fields: Vec::new(),
            opted_out: false,
            opted_out_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn opt_out(&mut self, at: DateTime<Utc>) {
        self.opted_out = true;
        self.opted_out_at = Some(at);
        self.updated_at = at;
    }

    /// Resolve a dotted field path with explicit fallthrough: known fields,
    /// then the metadata map, then custom fields. Absence is a typed
    /// `Missing`, never an error.
    pub fn resolve_field(&self, path: &str) -> FieldValue {
        let text = |value: Option<&str>| match value {
            Some(v) if !v.is_empty() => FieldValue::Text(v.to_string()),
            _ => FieldValue::Missing,
        };

        match path {
            "phone" => text(Some(self.phone.as_str())),
            "name" => text(self.name.as_deref()),
            "email" => text(self.email.as_deref()),
            _ => {
                if let Some(key) = path.strip_prefix("metadata.") {
                    return text(self.metadata.get(key).map(String::as_str));
                }
                if let Some(key) = path.strip_prefix("custom.") {
                    return text(
                        self.custom_fields
                            .iter()
                            .find(|f| f.key == key)
                            .map(|f| f.value.as_str()),
                    );
                }
                // Bare keys fall through to metadata, matching how imports
                // store ad-hoc columns.
                text(self.metadata.get(path).map(String::as_str))
            }
        }
    }
}

/// How a campaign describes its audience.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind")]
pub enum RecipientSpec {
    /// Explicit contact id list captured at creation time.
    Static { contact_ids: Vec<String> },
    /// Every non-opted-out contact of the tenant.
    All,
    /// Contacts carrying at least one of the tags.
    Tags { tags: Vec<String> },
    /// A saved segment maintained by the (external) contacts subsystem.
    Segment { segment_id: String },
}

#[async_trait]
pub trait ContactRepository: Send + Sync {
    async fn insert(&self, contact: &Contact) -> Result<()>;

    async fn find_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<Contact>>;

    async fn find_by_ids(&self, tenant_id: &str, ids: &[String]) -> Result<Vec<Contact>>;

    async fn find_by_phone(&self, tenant_id: &str, phone: &str) -> Result<Option<Contact>>;

    /// Create-or-update keyed by (tenant, phone); used by inbound ingestion.
    async fn upsert_by_phone(
        &self,
        tenant_id: &str,
        phone: &str,
        name: Option<String>,
    ) -> Result<Contact>;

    async fn update(&self, contact: &Contact) -> Result<()>;

    async fn add_tag(&self, tenant_id: &str, id: &str, tag: &str) -> Result<bool>;

    async fn remove_tag(&self, tenant_id: &str, id: &str, tag: &str) -> Result<bool>;

    /// Resolve a recipient spec to concrete contacts, excluding opted-out
    /// contacts. Campaign recipient resolution goes through here only.
    async fn resolve_recipients(
        &self,
        tenant_id: &str,
        spec: &RecipientSpec,
    ) -> Result<Vec<Contact>>;

    async fn delete_all_for_tenant(&self, tenant_id: &str) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_resolution_falls_through_regions() {
        let mut contact = Contact::new("t1", "15551234567");
        contact.name = Some("Ada".into());
        contact.metadata.insert("city".into(), "Lisbon".into());
        contact.custom_fields.push(CustomField {
            key: "plan".into(),
            value: "gold".into(),
        });

        assert_eq!(contact.resolve_field("name"), FieldValue::Text("Ada".into()));
        assert_eq!(
            contact.resolve_field("metadata.city"),
            FieldValue::Text("Lisbon".into())
        );
        assert_eq!(
            contact.resolve_field("city"),
            FieldValue::Text("Lisbon".into())
        );
        assert_eq!(
            contact.resolve_field("custom.plan"),
            FieldValue::Text("gold".into())
        );
        assert_eq!(contact.resolve_field("custom.nope"), FieldValue::Missing);
        assert_eq!(contact.resolve_field("unknown"), FieldValue::Missing);
    }

    #[test]
    fn empty_values_resolve_to_missing() {
        let mut contact = Contact::new("t1", "15551234567");
        contact.metadata.insert("empty".into(), "".into());
        assert_eq!(contact.resolve_field("metadata.empty"), FieldValue::Missing);
    }
}
