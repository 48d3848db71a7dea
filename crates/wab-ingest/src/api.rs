//! Webhook Intake Endpoint
//!
//! One axum router receives all provider callbacks:
//! - `GET /webhooks/whatsapp` answers the subscription verify handshake
//! - `POST /webhooks/whatsapp` verifies `X-Hub-Signature-256` over the raw
//!   body, then processes the envelope. Processing errors still return 200
//!   (providers require a fast 2xx) and are only visible as metrics/logs.
//! - `GET /healthz` reports store/queue reachability

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::ingest::WebhookIngester;
use wab_provider::WebhookEnvelope;
use wab_queue::JobConsumer;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

#[derive(Clone)]
pub struct IngestState {
    pub ingester: Arc<WebhookIngester>,
    pub verify_token: String,
    /// App secret for signature verification; unsigned intake is only
    /// allowed when absent (development mode).
    pub app_secret: Option<String>,
    pub queue: Arc<dyn wab_queue::JobQueue>,
}

pub fn intake_router(state: IngestState) -> Router {
    Router::new()
        .route("/webhooks/whatsapp", get(verify_subscription).post(receive))
        .route("/healthz", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

async fn verify_subscription(
    State(state): State<IngestState>,
    Query(query): Query<VerifyQuery>,
) -> Response {
    let token_matches = query.verify_token.as_deref() == Some(state.verify_token.as_str());
    if query.mode.as_deref() == Some("subscribe") && token_matches {
        debug!("Webhook subscription verified");
        return (StatusCode::OK, query.challenge.unwrap_or_default()).into_response();
    }
    warn!("Webhook verification rejected");
    StatusCode::FORBIDDEN.into_response()
}

/// Check `X-Hub-Signature-256: sha256=<hex hmac>` over the raw body.
fn signature_valid(app_secret: &str, headers: &HeaderMap, body: &[u8]) -> bool {
    let Some(header) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(claimed_hex) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(claimed) = hex::decode(claimed_hex) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    expected.ct_eq(claimed.as_slice()).into()
}

async fn receive(
    State(state): State<IngestState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(app_secret) = &state.app_secret {
        if !signature_valid(app_secret, &headers, &body) {
            metrics::counter!("wab_webhook_bad_signature_total").increment(1);
            warn!("Webhook rejected: invalid signature");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let envelope: WebhookEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            // Malformed payloads are acknowledged so the provider does not
            // retry them forever.
            metrics::counter!("wab_webhook_errors_total").increment(1);
            warn!(error = %e, "Webhook payload failed to parse");
            return StatusCode::OK.into_response();
        }
    };

    state.ingester.process(&envelope).await;
    StatusCode::OK.into_response()
}

async fn health(State(state): State<IngestState>) -> Response {
    match state.queue.metrics().await {
        Ok(metrics) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "queue": {
                    "pending": metrics.pending,
                    "inFlight": metrics.in_flight,
                    "delayed": metrics.delayed,
                    "dead": metrics.dead,
                },
            })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "degraded", "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn signature_verification_round_trip() {
        let body = br#"{"object":"whatsapp_business_account"}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            sign("secret", body).parse().unwrap(),
        );
        assert!(signature_valid("secret", &headers, body));
        assert!(!signature_valid("other-secret", &headers, body));
        assert!(!signature_valid("secret", &headers, b"tampered"));
    }

    #[test]
    fn missing_or_malformed_signature_is_rejected() {
        let headers = HeaderMap::new();
        assert!(!signature_valid("secret", &headers, b"body"));

        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, "md5=abcd".parse().unwrap());
        assert!(!signature_valid("secret", &headers, b"body"));
    }
}
