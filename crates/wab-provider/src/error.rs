//! Provider Error Classification
//!
//! The upstream error taxonomy consumed by the send pipeline, batch worker
//! and webhook observers. Every provider failure collapses into one class
//! that dictates the caller's move: back off, retry, pause the campaign, or
//! mark the single message failed.

use std::time::Duration;
use thiserror::Error;

/// Stable classification of a provider failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// 429s and rate-limit subcodes; back off and requeue with the hint.
    RateLimit { retry_after: Option<Duration> },
    /// 5xx / network timeouts; retry under the job policy.
    Temporary,
    /// Expired or invalid token; pause the campaign (TOKEN_EXPIRED).
    AuthFatal,
    /// Account blocked or messaging capability revoked; pause the campaign.
    AccountFatal { capability_revoked: bool },
    /// Template paused/rejected at send time; pause the campaign
    /// (TEMPLATE_REVOKED).
    TemplateFatal,
    /// Phone not on the platform; fail the message, do not pause.
    InvalidRecipient,
    /// Fixable 4xx payload problems; fail the message, do not retry.
    ClientError,
}

impl ErrorClass {
    pub fn pauses_campaign(&self) -> bool {
        matches!(
            self,
            ErrorClass::AuthFatal | ErrorClass::AccountFatal { .. } | ErrorClass::TemplateFatal
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::RateLimit { .. } | ErrorClass::Temporary)
    }
}

/// Error body shape of the Graph API.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct GraphErrorBody {
    pub error: GraphError,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct GraphError {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub error_subcode: Option<i64>,
    #[serde(default)]
    pub fbtrace_id: Option<String>,
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider API error {code}: {message}")]
    Api {
        class: ErrorClass,
        code: i64,
        message: String,
        status: u16,
    },

    #[error("Provider request failed: {0}")]
    Transport(String),

    #[error("Unexpected provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::Api { class, .. } => class.clone(),
            ProviderError::Transport(_) => ErrorClass::Temporary,
            ProviderError::Decode(_) => ErrorClass::Temporary,
        }
    }

    pub fn provider_code(&self) -> Option<i64> {
        match self {
            ProviderError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

// Graph API error codes the classifier keys on.
const CODE_AUTH_EXCEPTION: i64 = 0;
const CODE_API_UNKNOWN: i64 = 1;
const CODE_API_SERVICE: i64 = 2;
const CODE_API_TOO_MANY_CALLS: i64 = 4;
const CODE_PERMISSION_DENIED: i64 = 10;
const CODE_ACCESS_TOKEN_EXPIRED: i64 = 190;
const CODE_TEMP_BLOCKED_POLICY: i64 = 368;
const CODE_RATE_LIMIT_HIT: i64 = 80007;
const CODE_SPAM_RATE_LIMIT: i64 = 131048;
const CODE_PAIR_RATE_LIMIT: i64 = 131056;
const CODE_CLOUD_RATE_LIMIT: i64 = 130429;
const CODE_RECIPIENT_INVALID: i64 = 131026;
const CODE_RECIPIENT_NOT_ALLOWED: i64 = 131030;
const CODE_ACCOUNT_LOCKED: i64 = 131031;
const CODE_TEMPLATE_PARAM_MISMATCH: i64 = 132000;
const CODE_TEMPLATE_NOT_FOUND: i64 = 132001;
const CODE_TEMPLATE_TEXT_TOO_LONG: i64 = 132005;
const CODE_TEMPLATE_FORMAT_MISMATCH: i64 = 132012;
const CODE_TEMPLATE_PAUSED: i64 = 132015;
const CODE_TEMPLATE_DISABLED: i64 = 132016;

/// Classify a failed response from the messaging API.
///
/// Precedence: explicit Graph error codes first, then the HTTP status. The
/// Retry-After hint (already parsed by the transport layer) rides along on
/// rate-limit classes.
pub fn classify(status: u16, error: Option<&GraphError>, retry_after: Option<Duration>) -> ErrorClass {
    if let Some(error) = error {
        match error.code {
            CODE_API_TOO_MANY_CALLS
            | CODE_RATE_LIMIT_HIT
            | CODE_SPAM_RATE_LIMIT
            | CODE_PAIR_RATE_LIMIT
            | CODE_CLOUD_RATE_LIMIT => {
                return ErrorClass::RateLimit { retry_after };
            }
            CODE_AUTH_EXCEPTION | CODE_ACCESS_TOKEN_EXPIRED => return ErrorClass::AuthFatal,
            CODE_ACCOUNT_LOCKED | CODE_TEMP_BLOCKED_POLICY => {
                return ErrorClass::AccountFatal {
                    capability_revoked: false,
                }
            }
            CODE_PERMISSION_DENIED => {
                return ErrorClass::AccountFatal {
                    capability_revoked: true,
                }
            }
            CODE_TEMPLATE_NOT_FOUND | CODE_TEMPLATE_PAUSED | CODE_TEMPLATE_DISABLED => {
                return ErrorClass::TemplateFatal
            }
            CODE_RECIPIENT_INVALID | CODE_RECIPIENT_NOT_ALLOWED => {
                return ErrorClass::InvalidRecipient
            }
            CODE_TEMPLATE_PARAM_MISMATCH
            | CODE_TEMPLATE_TEXT_TOO_LONG
            | CODE_TEMPLATE_FORMAT_MISMATCH => return ErrorClass::ClientError,
            CODE_API_UNKNOWN | CODE_API_SERVICE => return ErrorClass::Temporary,
            _ => {}
        }
    }

    match status {
        429 => ErrorClass::RateLimit { retry_after },
        401 => ErrorClass::AuthFatal,
        403 => ErrorClass::AccountFatal {
            capability_revoked: true,
        },
        s if s >= 500 => ErrorClass::Temporary,
        s if s >= 400 => ErrorClass::ClientError,
        _ => ErrorClass::Temporary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_error(code: i64) -> GraphError {
        GraphError {
            message: "boom".into(),
            error_type: "OAuthException".into(),
            code,
            error_subcode: None,
            fbtrace_id: None,
        }
    }

    #[test]
    fn rate_limit_codes_carry_the_hint() {
        let hint = Some(Duration::from_secs(15));
        let class = classify(400, Some(&graph_error(130429)), hint);
        assert_eq!(class, ErrorClass::RateLimit { retry_after: hint });
        assert!(class.is_retryable());
        assert!(!class.pauses_campaign());
    }

    #[test]
    fn http_429_without_code_is_rate_limit() {
        let class = classify(429, None, None);
        assert!(matches!(class, ErrorClass::RateLimit { .. }));
    }

    #[test]
    fn token_expiry_is_auth_fatal() {
        let class = classify(401, Some(&graph_error(190)), None);
        assert_eq!(class, ErrorClass::AuthFatal);
        assert!(class.pauses_campaign());
    }

    #[test]
    fn account_and_capability_codes_pause() {
        assert_eq!(
            classify(400, Some(&graph_error(131031)), None),
            ErrorClass::AccountFatal {
                capability_revoked: false
            }
        );
        assert_eq!(
            classify(403, Some(&graph_error(10)), None),
            ErrorClass::AccountFatal {
                capability_revoked: true
            }
        );
    }

    #[test]
    fn template_codes_split_fatal_from_client() {
        assert_eq!(
            classify(400, Some(&graph_error(132015)), None),
            ErrorClass::TemplateFatal
        );
        // Parameter mismatch is a fixable payload problem, not a revocation.
        assert_eq!(
            classify(400, Some(&graph_error(132000)), None),
            ErrorClass::ClientError
        );
    }

    #[test]
    fn invalid_recipient_does_not_pause() {
        let class = classify(400, Some(&graph_error(131026)), None);
        assert_eq!(class, ErrorClass::InvalidRecipient);
        assert!(!class.pauses_campaign());
        assert!(!class.is_retryable());
    }

    #[test]
    fn plain_5xx_is_temporary() {
        assert_eq!(classify(503, None, None), ErrorClass::Temporary);
    }
}
