//! WaBridge Provider Client
//!
//! The Meta WhatsApp Cloud API surface: message emission with bit-exact
//! payload shapes, phone/template/token management, webhook wire types, and
//! the error taxonomy the rest of the platform switches on.

pub mod client;
pub mod error;
pub mod events;
pub mod payload;

pub use client::{
    CloudApiClient, CloudApiConfig, PhoneCredentials, PhoneNumberInfo, TemplateInfo,
    TemplateListResponse, TokenResponse, DEFAULT_GRAPH_BASE,
};
pub use error::{classify, ErrorClass, GraphError, GraphErrorBody, ProviderError, Result};
pub use events::{
    AdReferral, Change, ChangeValue, ConversationInfo, Entry, InboundMessage, InboundText,
    Metadata, PricingInfo, StatusError, StatusEvent, WebhookContact, WebhookEnvelope,
    FIELD_ACCOUNT, FIELD_MESSAGES, FIELD_QUALITY, FIELD_TEMPLATE_STATUS,
};
pub use payload::{
    normalize_phone, ButtonSubType, Component, ComponentType, CurrencyParameter,
    DateTimeParameter, MediaLink, MediaMessageRequest, Parameter, SendResponse,
    SendResponseContact, SendResponseMessage, TemplateMessageRequest, TextMessageRequest,
};
