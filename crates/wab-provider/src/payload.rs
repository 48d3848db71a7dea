//! Cloud API Message Payloads
//!
//! Typed request bodies for the `/messages` endpoint. The parameter shapes
//! are bit-exact against the provider schema: header parameters are
//! type-specific, body parameters are positional, and button parameters
//! carry `sub_type` + `index`.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorClass, ProviderError, Result};

pub const MESSAGING_PRODUCT: &str = "whatsapp";
pub const RECIPIENT_TYPE_INDIVIDUAL: &str = "individual";

/// Normalize a phone number to E.164 digits (no leading `+`).
pub fn normalize_phone(raw: &str) -> Result<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 8 || digits.len() > 15 || digits.starts_with('0') {
        return Err(ProviderError::Api {
            class: ErrorClass::InvalidRecipient,
            code: 0,
            message: format!("not an E.164 phone number: {raw}"),
            status: 0,
        });
    }
    Ok(digits)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaLink {
    pub link: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl MediaLink {
    pub fn new(link: impl Into<String>) -> Self {
        Self {
            link: link.into(),
            caption: None,
            filename: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrencyParameter {
    pub fallback_value: String,
    pub code: String,
    /// Amount multiplied by 1000, per provider schema.
    pub amount_1000: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DateTimeParameter {
    pub fallback_value: String,
}

/// One template component parameter, tagged exactly as the provider expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Parameter {
    Text { text: String },
    Currency { currency: CurrencyParameter },
    DateTime { date_time: DateTimeParameter },
    Image { image: MediaLink },
    Document { document: MediaLink },
    Video { video: MediaLink },
    /// Quick-reply button payload.
    Payload { payload: String },
}

impl Parameter {
    pub fn text(value: impl Into<String>) -> Self {
        Parameter::Text { text: value.into() }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    Header,
    Body,
    Button,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ButtonSubType {
    QuickReply,
    Url,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<ButtonSubType>,
    /// Button position as a string, per provider schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    pub parameters: Vec<Parameter>,
}

impl Component {
    pub fn header(parameters: Vec<Parameter>) -> Self {
        Self {
            component_type: ComponentType::Header,
            sub_type: None,
            index: None,
            parameters,
        }
    }

    pub fn body(parameters: Vec<Parameter>) -> Self {
        Self {
            component_type: ComponentType::Body,
            sub_type: None,
            index: None,
            parameters,
        }
    }

    pub fn button(sub_type: ButtonSubType, index: u32, parameters: Vec<Parameter>) -> Self {
        Self {
            component_type: ComponentType::Button,
            sub_type: Some(sub_type),
            index: Some(index.to_string()),
            parameters,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateLanguage {
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateBody {
    pub name: String,
    pub language: TemplateLanguage,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub components: Vec<Component>,
}

/// Outbound template message request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateMessageRequest {
    pub messaging_product: String,
    pub recipient_type: String,
    pub to: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub template: TemplateBody,
}

impl TemplateMessageRequest {
    pub fn new(to: impl Into<String>, name: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            messaging_product: MESSAGING_PRODUCT.to_string(),
            recipient_type: RECIPIENT_TYPE_INDIVIDUAL.to_string(),
            to: to.into(),
            message_type: "template".to_string(),
            template: TemplateBody {
                name: name.into(),
                language: TemplateLanguage {
                    code: language.into(),
                },
                components: Vec::new(),
            },
        }
    }

    pub fn with_component(mut self, component: Component) -> Self {
        self.template.components.push(component);
        self
    }
}

/// Outbound free-form text request (session messages).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextMessageRequest {
    pub messaging_product: String,
    pub recipient_type: String,
    pub to: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub text: TextBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBody {
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<bool>,
}

impl TextMessageRequest {
    pub fn new(to: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            messaging_product: MESSAGING_PRODUCT.to_string(),
            recipient_type: RECIPIENT_TYPE_INDIVIDUAL.to_string(),
            to: to.into(),
            message_type: "text".to_string(),
            text: TextBody {
                body: body.into(),
                preview_url: None,
            },
        }
    }
}

/// Outbound media request; the `type` field and the media key must agree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaMessageRequest {
    pub messaging_product: String,
    pub recipient_type: String,
    pub to: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<MediaLink>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<MediaLink>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<MediaLink>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<MediaLink>,
}

impl MediaMessageRequest {
    pub fn new(to: impl Into<String>, kind: &str, media: MediaLink) -> Self {
        let mut request = Self {
            messaging_product: MESSAGING_PRODUCT.to_string(),
            recipient_type: RECIPIENT_TYPE_INDIVIDUAL.to_string(),
            to: to.into(),
            message_type: kind.to_string(),
            image: None,
            video: None,
            document: None,
            audio: None,
        };
        match kind {
            "image" => request.image = Some(media),
            "video" => request.video = Some(media),
            "document" => request.document = Some(media),
            "audio" => request.audio = Some(media),
            _ => request.document = Some(media),
        }
        request
    }
}

/// Successful `/messages` response.
#[derive(Debug, Clone, Deserialize)]
pub struct SendResponse {
    #[serde(default)]
    pub messaging_product: String,
    #[serde(default)]
    pub contacts: Vec<SendResponseContact>,
    #[serde(default)]
    pub messages: Vec<SendResponseMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendResponseContact {
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub wa_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendResponseMessage {
    pub id: String,
}

impl SendResponse {
    pub fn provider_message_id(&self) -> Option<&str> {
        self.messages.first().map(|m| m.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_common_phone_formats() {
        assert_eq!(normalize_phone("+1 (555) 123-4567").unwrap(), "15551234567");
        assert_eq!(normalize_phone("15551234567").unwrap(), "15551234567");
        assert!(normalize_phone("not-a-phone").is_err());
        assert!(normalize_phone("0123456789").is_err());
        assert!(normalize_phone("123").is_err());
    }

    #[test]
    fn template_request_matches_provider_schema() {
        let request = TemplateMessageRequest::new("15551234567", "order_update", "en_US")
            .with_component(Component::body(vec![Parameter::text("Ada")]))
            .with_component(Component::button(
                ButtonSubType::Url,
                0,
                vec![Parameter::text("42")],
            ));

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": "15551234567",
                "type": "template",
                "template": {
                    "name": "order_update",
                    "language": { "code": "en_US" },
                    "components": [
                        {
                            "type": "body",
                            "parameters": [ { "type": "text", "text": "Ada" } ]
                        },
                        {
                            "type": "button",
                            "sub_type": "url",
                            "index": "0",
                            "parameters": [ { "type": "text", "text": "42" } ]
                        }
                    ]
                }
            })
        );
    }

    #[test]
    fn header_media_parameter_shape() {
        let component = Component::header(vec![Parameter::Image {
            image: MediaLink::new("https://cdn.example.com/a.jpg"),
        }]);
        let value = serde_json::to_value(&component).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "header",
                "parameters": [
                    { "type": "image", "image": { "link": "https://cdn.example.com/a.jpg" } }
                ]
            })
        );
    }

    #[test]
    fn currency_and_datetime_parameters() {
        let value = serde_json::to_value(Parameter::Currency {
            currency: CurrencyParameter {
                fallback_value: "$10.00".into(),
                code: "USD".into(),
                amount_1000: 10_000,
            },
        })
        .unwrap();
        assert_eq!(
            value,
            json!({
                "type": "currency",
                "currency": {
                    "fallback_value": "$10.00",
                    "code": "USD",
                    "amount_1000": 10000
                }
            })
        );

        let value = serde_json::to_value(Parameter::DateTime {
            date_time: DateTimeParameter {
                fallback_value: "Feb 25, 2026".into(),
            },
        })
        .unwrap();
        assert_eq!(
            value,
            json!({
                "type": "date_time",
                "date_time": { "fallback_value": "Feb 25, 2026" }
            })
        );
    }

    #[test]
    fn send_response_exposes_message_id() {
        let response: SendResponse = serde_json::from_value(json!({
            "messaging_product": "whatsapp",
            "contacts": [{ "input": "+15551234567", "wa_id": "15551234567" }],
            "messages": [{ "id": "wamid.ABC" }]
        }))
        .unwrap();
        assert_eq!(response.provider_message_id(), Some("wamid.ABC"));
    }
}
