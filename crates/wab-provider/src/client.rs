//! Cloud API Client
//!
//! Thin wrapper over the Graph API messaging surface. Every failure is
//! classified before it leaves this module; callers switch on the class,
//! never on message text.

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{classify, GraphErrorBody, ProviderError, Result};
use crate::payload::{
    MediaLink, MediaMessageRequest, SendResponse, TemplateMessageRequest, TextMessageRequest,
};

pub const DEFAULT_GRAPH_BASE: &str = "https://graph.facebook.com/v19.0";

/// Per-tenant credentials handed in on every call; the client itself is
/// tenant-agnostic and shared.
#[derive(Debug, Clone)]
pub struct PhoneCredentials {
    pub access_token: String,
    pub phone_number_id: String,
}

#[derive(Debug, Clone)]
pub struct CloudApiConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for CloudApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_GRAPH_BASE.to_string(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

pub struct CloudApiClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhoneNumberInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub display_phone_number: String,
    #[serde(default)]
    pub verified_name: String,
    #[serde(default)]
    pub quality_rating: String,
    #[serde(default)]
    pub code_verification_status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub language: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateListResponse {
    #[serde(default)]
    pub data: Vec<TemplateInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdResponse {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SuccessResponse {
    #[serde(default)]
    pub success: bool,
}

impl CloudApiClient {
    pub fn new(config: CloudApiConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to build HTTP client");
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Decode a response, classifying failures.
    async fn read<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ProviderError::Decode(e.to_string()));
        }

        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);

        let body = response.text().await.unwrap_or_default();
        let graph_error = serde_json::from_str::<GraphErrorBody>(&body)
            .ok()
            .map(|b| b.error);

        let class = classify(status.as_u16(), graph_error.as_ref(), retry_after);
        let (code, message) = match graph_error {
            Some(e) => (e.code, e.message),
            None => (0, format!("HTTP {status}")),
        };

        warn!(
            status = status.as_u16(),
            code = code,
            class = ?class,
            "Provider call failed"
        );

        Err(ProviderError::Api {
            class,
            code,
            message,
            status: status.as_u16(),
        })
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    pub async fn send_template(
        &self,
        creds: &PhoneCredentials,
        request: &TemplateMessageRequest,
    ) -> Result<SendResponse> {
        debug!(
            phone_number_id = %creds.phone_number_id,
            template = %request.template.name,
            to = %request.to,
            "Sending template message"
        );
        let response = self
            .client
            .post(format!(
                "{}/{}/messages",
                self.base_url, creds.phone_number_id
            ))
            .bearer_auth(&creds.access_token)
            .json(request)
            .send()
            .await?;
        self.read(response).await
    }

    pub async fn send_text(
        &self,
        creds: &PhoneCredentials,
        request: &TextMessageRequest,
    ) -> Result<SendResponse> {
        let response = self
            .client
            .post(format!(
                "{}/{}/messages",
                self.base_url, creds.phone_number_id
            ))
            .bearer_auth(&creds.access_token)
            .json(request)
            .send()
            .await?;
        self.read(response).await
    }

    pub async fn send_media(
        &self,
        creds: &PhoneCredentials,
        to: &str,
        kind: &str,
        media: MediaLink,
    ) -> Result<SendResponse> {
        let request = MediaMessageRequest::new(to, kind, media);
        let response = self
            .client
            .post(format!(
                "{}/{}/messages",
                self.base_url, creds.phone_number_id
            ))
            .bearer_auth(&creds.access_token)
            .json(&request)
            .send()
            .await?;
        self.read(response).await
    }

    // ------------------------------------------------------------------
    // Phone number management
    // ------------------------------------------------------------------

    pub async fn get_phone_number(&self, creds: &PhoneCredentials) -> Result<PhoneNumberInfo> {
        let response = self
            .client
            .get(format!("{}/{}", self.base_url, creds.phone_number_id))
            .query(&[(
                "fields",
                "id,display_phone_number,verified_name,quality_rating,code_verification_status",
            )])
            .bearer_auth(&creds.access_token)
            .send()
            .await?;
        self.read(response).await
    }

    pub async fn register_phone(&self, creds: &PhoneCredentials, pin: &str) -> Result<bool> {
        let response = self
            .client
            .post(format!(
                "{}/{}/register",
                self.base_url, creds.phone_number_id
            ))
            .bearer_auth(&creds.access_token)
            .json(&json!({ "messaging_product": "whatsapp", "pin": pin }))
            .send()
            .await?;
        let result: SuccessResponse = self.read(response).await?;
        Ok(result.success)
    }

    pub async fn request_verification_code(
        &self,
        creds: &PhoneCredentials,
        method: &str,
        language: &str,
    ) -> Result<bool> {
        let response = self
            .client
            .post(format!(
                "{}/{}/request_code",
                self.base_url, creds.phone_number_id
            ))
            .bearer_auth(&creds.access_token)
            .json(&json!({ "code_method": method, "language": language }))
            .send()
            .await?;
        let result: SuccessResponse = self.read(response).await?;
        Ok(result.success)
    }

    pub async fn verify_code(&self, creds: &PhoneCredentials, code: &str) -> Result<bool> {
        let response = self
            .client
            .post(format!(
                "{}/{}/verify_code",
                self.base_url, creds.phone_number_id
            ))
            .bearer_auth(&creds.access_token)
            .json(&json!({ "code": code }))
            .send()
            .await?;
        let result: SuccessResponse = self.read(response).await?;
        Ok(result.success)
    }

    // ------------------------------------------------------------------
    // Onboarding support (system users, tokens, templates)
    // ------------------------------------------------------------------

    pub async fn create_system_user(
        &self,
        business_id: &str,
        access_token: &str,
        name: &str,
    ) -> Result<IdResponse> {
        let response = self
            .client
            .post(format!("{}/{}/system_users", self.base_url, business_id))
            .bearer_auth(access_token)
            .json(&json!({ "name": name, "role": "EMPLOYEE" }))
            .send()
            .await?;
        self.read(response).await
    }

    /// Exchange a short-lived user token for a long-lived one.
    pub async fn mint_long_lived_token(
        &self,
        app_id: &str,
        app_secret: &str,
        short_lived_token: &str,
    ) -> Result<TokenResponse> {
        let response = self
            .client
            .get(format!("{}/oauth/access_token", self.base_url))
            .query(&[
                ("grant_type", "fb_exchange_token"),
                ("client_id", app_id),
                ("client_secret", app_secret),
                ("fb_exchange_token", short_lived_token),
            ])
            .send()
            .await?;
        self.read(response).await
    }

    pub async fn list_templates(
        &self,
        waba_id: &str,
        access_token: &str,
    ) -> Result<TemplateListResponse> {
        let response = self
            .client
            .get(format!("{}/{}/message_templates", self.base_url, waba_id))
            .query(&[("fields", "id,name,status,category,language"), ("limit", "100")])
            .bearer_auth(access_token)
            .send()
            .await?;
        self.read(response).await
    }

    pub async fn delete_template(
        &self,
        waba_id: &str,
        access_token: &str,
        name: &str,
    ) -> Result<bool> {
        let response = self
            .client
            .delete(format!("{}/{}/message_templates", self.base_url, waba_id))
            .query(&[("name", name)])
            .bearer_auth(access_token)
            .send()
            .await?;
        let result: SuccessResponse = self.read(response).await?;
        Ok(result.success)
    }
}

impl Default for CloudApiClient {
    fn default() -> Self {
        Self::new(CloudApiConfig::default())
    }
}
