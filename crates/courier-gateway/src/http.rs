//! HTTP provider gateway.
//!
//! A reqwest client for an HTTP messaging provider. Retry is *not*
//! handled here - one call is one attempt; the dispatcher owns the
//! retry schedule through the queue store.

use crate::{
    ErrorCategory, GatewayError, GatewayResult, OutboundMessage, SendGateway, SendOutcome,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpGatewayConfig {
    /// Base URL of the provider API.
    pub api_url: String,
    /// Bearer token for the provider API.
    pub api_token: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Provider error codes that signal a burst-abuse pattern rather
    /// than ordinary throttling.
    pub abuse_error_codes: Vec<String>,
}

impl Default for HttpGatewayConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.provider.example".to_string(),
            api_token: String::new(),
            timeout_secs: 30,
            abuse_error_codes: vec!["burst_abuse".to_string()],
        }
    }
}

/// Request payload for one send.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest<'a> {
    channel_id: &'a str,
    recipient: &'a str,
    payload: &'a serde_json::Value,
    /// Client reference; lets the provider deduplicate on its side too.
    client_ref: &'a str,
}

/// Success body from the provider.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    message_id: String,
}

/// Error body from the provider.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP implementation of [`SendGateway`].
pub struct HttpGateway {
    config: HttpGatewayConfig,
    client: Client,
}

impl HttpGateway {
    /// Create a new HTTP gateway.
    pub fn new(config: HttpGatewayConfig) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        Ok(Self { config, client })
    }

    /// Map a non-success provider response to a rejection outcome.
    fn classify(&self, status: StatusCode, body: ErrorResponse) -> SendOutcome {
        let code = body
            .code
            .unwrap_or_else(|| status.as_u16().to_string());

        let category = if self.config.abuse_error_codes.contains(&code) {
            ErrorCategory::AbuseSignal
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            ErrorCategory::RateLimited
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            ErrorCategory::AuthExpired
        } else if status.is_server_error() {
            ErrorCategory::Transient
        } else {
            ErrorCategory::Permanent
        };

        SendOutcome::Rejected {
            category,
            code,
            message: body.message,
        }
    }
}

#[async_trait]
impl SendGateway for HttpGateway {
    async fn send(&self, message: OutboundMessage<'_>) -> GatewayResult<SendOutcome> {
        let url = format!("{}/messages", self.config.api_url);

        let request = SendRequest {
            channel_id: message.channel_id,
            recipient: message.recipient,
            payload: message.payload,
            client_ref: message.entry_id,
        };

        debug!(
            entry_id = %message.entry_id,
            channel_id = %message.channel_id,
            "Sending message"
        );

        let response = match self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_token))
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                // Connect/timeout failures are retryable by definition.
                debug!(entry_id = %message.entry_id, error = %e, "Transport failure");
                return Ok(SendOutcome::Rejected {
                    category: ErrorCategory::Transient,
                    code: "network".to_string(),
                    message: Some(e.to_string()),
                });
            }
        };

        let status = response.status();
        if status.is_success() {
            let body: SendResponse = response
                .json()
                .await
                .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
            return Ok(SendOutcome::Delivered {
                external_message_id: body.message_id,
            });
        }

        let body: ErrorResponse = response.json().await.unwrap_or_default();
        Ok(self.classify(status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway_with_abuse_codes(codes: &[&str]) -> HttpGateway {
        HttpGateway::new(HttpGatewayConfig {
            abuse_error_codes: codes.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_classify_rate_limited() {
        let gateway = gateway_with_abuse_codes(&[]);
        let outcome = gateway.classify(StatusCode::TOO_MANY_REQUESTS, ErrorResponse::default());
        assert!(matches!(
            outcome,
            SendOutcome::Rejected {
                category: ErrorCategory::RateLimited,
                ..
            }
        ));
    }

    #[test]
    fn test_classify_abuse_code_wins_over_status() {
        let gateway = gateway_with_abuse_codes(&["burst_abuse"]);
        let body = ErrorResponse {
            code: Some("burst_abuse".to_string()),
            message: None,
        };
        // Even on a 429, a provider abuse code is an abuse signal.
        let outcome = gateway.classify(StatusCode::TOO_MANY_REQUESTS, body);
        assert!(matches!(
            outcome,
            SendOutcome::Rejected {
                category: ErrorCategory::AbuseSignal,
                ..
            }
        ));
    }

    #[test]
    fn test_classify_auth_and_server_errors() {
        let gateway = gateway_with_abuse_codes(&[]);

        let outcome = gateway.classify(StatusCode::UNAUTHORIZED, ErrorResponse::default());
        assert!(matches!(
            outcome,
            SendOutcome::Rejected {
                category: ErrorCategory::AuthExpired,
                ..
            }
        ));

        let outcome = gateway.classify(StatusCode::BAD_GATEWAY, ErrorResponse::default());
        assert!(matches!(
            outcome,
            SendOutcome::Rejected {
                category: ErrorCategory::Transient,
                ..
            }
        ));

        let outcome = gateway.classify(StatusCode::BAD_REQUEST, ErrorResponse::default());
        assert!(matches!(
            outcome,
            SendOutcome::Rejected {
                category: ErrorCategory::Permanent,
                ..
            }
        ));
    }

    #[test]
    fn test_classify_keeps_provider_code() {
        let gateway = gateway_with_abuse_codes(&[]);
        let body = ErrorResponse {
            code: Some("invalid_recipient".to_string()),
            message: Some("unknown number".to_string()),
        };
        let outcome = gateway.classify(StatusCode::BAD_REQUEST, body);
        assert_eq!(
            outcome.error_code().as_deref(),
            Some("permanent:invalid_recipient")
        );
    }
}
