//! CloudApiClient HTTP Tests
//!
//! Wiremock-backed coverage of the messaging calls and the error
//! classification ladder.

use std::time::Duration;
use wiremock::matchers::{bearer_token, body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use wab_provider::{
    CloudApiClient, CloudApiConfig, ErrorClass, Parameter, PhoneCredentials, ProviderError,
    TemplateMessageRequest, TextMessageRequest,
};

fn client_for(server: &MockServer) -> CloudApiClient {
    CloudApiClient::new(CloudApiConfig {
        base_url: server.uri(),
        timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(2),
    })
}

fn creds() -> PhoneCredentials {
    PhoneCredentials {
        access_token: "test-token".into(),
        phone_number_id: "phone-1".into(),
    }
}

#[tokio::test]
async fn send_template_posts_provider_schema_and_returns_wamid() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/phone-1/messages"))
        .and(bearer_token("test-token"))
        .and(body_partial_json(serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": "15551234567",
            "type": "template",
            "template": { "name": "order_update", "language": { "code": "en_US" } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "messaging_product": "whatsapp",
            "contacts": [{ "input": "15551234567", "wa_id": "15551234567" }],
            "messages": [{ "id": "wamid.HAPPY" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let request = TemplateMessageRequest::new("15551234567", "order_update", "en_US")
        .with_component(wab_provider::Component::body(vec![Parameter::text("Ada")]));

    let response = client_for(&server)
        .send_template(&creds(), &request)
        .await
        .unwrap();
    assert_eq!(response.provider_message_id(), Some("wamid.HAPPY"));
}

#[tokio::test]
async fn rate_limit_response_classifies_with_retry_hint() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/phone-1/messages"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "15")
                .set_body_json(serde_json::json!({
                    "error": {
                        "message": "Too many messages",
                        "type": "OAuthException",
                        "code": 130429
                    }
                })),
        )
        .mount(&server)
        .await;

    let request = TextMessageRequest::new("15551234567", "hi");
    let err = client_for(&server)
        .send_text(&creds(), &request)
        .await
        .unwrap_err();

    match err {
        ProviderError::Api { class, code, .. } => {
            assert_eq!(code, 130429);
            assert_eq!(
                class,
                ErrorClass::RateLimit {
                    retry_after: Some(Duration::from_secs(15))
                }
            );
        }
        other => panic!("expected Api error, got {other:?}"),
    }
}

#[tokio::test]
async fn expired_token_classifies_auth_fatal() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/phone-1/messages"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "error": {
                "message": "Error validating access token: Session has expired",
                "type": "OAuthException",
                "code": 190
            }
        })))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .send_text(&creds(), &TextMessageRequest::new("15551234567", "hi"))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::AuthFatal);
    assert!(err.class().pauses_campaign());
}

#[tokio::test]
async fn template_paused_classifies_template_fatal() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/phone-1/messages"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": {
                "message": "Template is paused",
                "type": "OAuthException",
                "code": 132015
            }
        })))
        .mount(&server)
        .await;

    let request = TemplateMessageRequest::new("15551234567", "order_update", "en_US");
    let err = client_for(&server)
        .send_template(&creds(), &request)
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::TemplateFatal);
}

#[tokio::test]
async fn unknown_recipient_classifies_invalid_recipient() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/phone-1/messages"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": {
                "message": "Message Undeliverable",
                "type": "OAuthException",
                "code": 131026
            }
        })))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .send_text(&creds(), &TextMessageRequest::new("15551234567", "hi"))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::InvalidRecipient);
    assert_eq!(err.provider_code(), Some(131026));
}

#[tokio::test]
async fn server_error_classifies_temporary() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/phone-1/messages"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .send_text(&creds(), &TextMessageRequest::new("15551234567", "hi"))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Temporary);
    assert!(err.class().is_retryable());
}

#[tokio::test]
async fn phone_number_lookup_reads_quality() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/phone-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "phone-1",
            "display_phone_number": "+1 555-000-1111",
            "verified_name": "Acme",
            "quality_rating": "GREEN"
        })))
        .mount(&server)
        .await;

    let info = client_for(&server).get_phone_number(&creds()).await.unwrap();
    assert_eq!(info.quality_rating, "GREEN");
    assert_eq!(info.verified_name, "Acme");
}
