//! Webhook Wire Types
//!
//! The provider's callback envelope: `entry[].changes[].value` with
//! `messages[]` for inbound traffic, `statuses[]` for delivery receipts,
//! and flat event fields for template-status, quality and account updates.
//! All value fields are optional; which ones are present depends on the
//! change's `field`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<Entry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// WABA id the events belong to.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    #[serde(default)]
    pub field: String,
    pub value: ChangeValue,
}

pub const FIELD_MESSAGES: &str = "messages";
pub const FIELD_TEMPLATE_STATUS: &str = "message_template_status_update";
pub const FIELD_QUALITY: &str = "phone_number_quality_update";
pub const FIELD_ACCOUNT: &str = "account_update";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messaging_product: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contacts: Vec<WebhookContact>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<InboundMessage>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<StatusEvent>,

    // --- message_template_status_update ---
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_template_id: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_template_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_template_language: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    // --- phone_number_quality_update ---
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_phone_number: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_limit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub display_phone_number: String,
    #[serde(default)]
    pub phone_number_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookContact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<ContactProfile>,
    #[serde(default)]
    pub wa_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactProfile {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(rename = "type", default)]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<InboundText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<InboundMedia>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<InboundMedia>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<InboundMedia>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<InboundMedia>,
    /// Click-to-WhatsApp ad attribution, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referral: Option<AdReferral>,
}

impl InboundMessage {
    pub fn body_text(&self) -> Option<&str> {
        self.text
            .as_ref()
            .map(|t| t.body.as_str())
            .or_else(|| self.caption())
    }

    pub fn caption(&self) -> Option<&str> {
        [&self.image, &self.video, &self.document]
            .into_iter()
            .flatten()
            .find_map(|m| m.caption.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundText {
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMedia {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdReferral {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headline: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    /// The provider message id (`wamid....`).
    #[serde(default)]
    pub id: String,
    /// `sent` / `delivered` / `read` / `failed`.
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub recipient_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ConversationInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<PricingInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<StatusError>,
}

impl StatusEvent {
    pub fn first_error_code(&self) -> Option<i64> {
        self.errors.first().map(|e| e.code)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<ConversationOrigin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationOrigin {
    #[serde(rename = "type", default)]
    pub origin_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingInfo {
    #[serde(default)]
    pub billable: bool,
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_status_callback() {
        let envelope: WebhookEnvelope = serde_json::from_value(json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "WABA_1",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "metadata": {
                            "display_phone_number": "15550001111",
                            "phone_number_id": "phone-1"
                        },
                        "statuses": [{
                            "id": "wamid.X",
                            "status": "delivered",
                            "timestamp": "1722470400",
                            "recipient_id": "15551234567",
                            "conversation": {
                                "id": "conv-1",
                                "origin": { "type": "utility" }
                            },
                            "pricing": {
                                "billable": true,
                                "category": "utility",
                                "pricing_model": "CBP"
                            }
                        }]
                    }
                }]
            }]
        }))
        .unwrap();

        let value = &envelope.entry[0].changes[0].value;
        assert_eq!(value.statuses.len(), 1);
        assert_eq!(value.statuses[0].status, "delivered");
        assert_eq!(
            value.metadata.as_ref().unwrap().phone_number_id,
            "phone-1"
        );
    }

    #[test]
    fn parses_inbound_text() {
        let envelope: WebhookEnvelope = serde_json::from_value(json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "WABA_1",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "metadata": { "display_phone_number": "x", "phone_number_id": "phone-1" },
                        "contacts": [{ "profile": { "name": "Ada" }, "wa_id": "15551234567" }],
                        "messages": [{
                            "from": "15551234567",
                            "id": "wamid.IN",
                            "timestamp": "1722470400",
                            "type": "text",
                            "text": { "body": "hello" }
                        }]
                    }
                }]
            }]
        }))
        .unwrap();

        let value = &envelope.entry[0].changes[0].value;
        assert_eq!(value.messages[0].body_text(), Some("hello"));
        assert_eq!(value.contacts[0].wa_id, "15551234567");
    }

    #[test]
    fn parses_template_status_update() {
        let envelope: WebhookEnvelope = serde_json::from_value(json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "WABA_1",
                "changes": [{
                    "field": "message_template_status_update",
                    "value": {
                        "event": "REJECTED",
                        "message_template_id": 1234,
                        "message_template_name": "order_update",
                        "message_template_language": "en_US",
                        "reason": "INCORRECT_CATEGORY"
                    }
                }]
            }]
        }))
        .unwrap();

        let change = &envelope.entry[0].changes[0];
        assert_eq!(change.field, FIELD_TEMPLATE_STATUS);
        assert_eq!(change.value.event.as_deref(), Some("REJECTED"));
        assert_eq!(
            change.value.message_template_name.as_deref(),
            Some("order_update")
        );
    }

    #[test]
    fn parses_failed_status_with_errors() {
        let event: StatusEvent = serde_json::from_value(json!({
            "id": "wamid.F",
            "status": "failed",
            "timestamp": "1722470400",
            "recipient_id": "15551234567",
            "errors": [{ "code": 131026, "title": "Message undeliverable" }]
        }))
        .unwrap();
        assert_eq!(event.first_error_code(), Some(131026));
    }
}
