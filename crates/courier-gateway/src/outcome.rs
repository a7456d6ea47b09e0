//! Send outcome taxonomy and the gateway trait.

use crate::GatewayResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Category of a provider rejection.
///
/// Every provider error must be mapped into one of these; the dispatcher,
/// rate controller, and circuit breaker all key off the category rather
/// than raw provider codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// 429-class throttling; retry with backoff and slow the channel down.
    RateLimited,
    /// Provider-detected burst pattern; feeds the abuse circuit breaker.
    AbuseSignal,
    /// Channel credentials are no longer valid; channel-level, not entry-level.
    AuthExpired,
    /// Network / 5xx; retry with backoff.
    Transient,
    /// Entry-level unrecoverable; fail immediately, no retry.
    Permanent,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::AbuseSignal => "abuse_signal",
            Self::AuthExpired => "auth_expired",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

/// Synchronous send-time outcome of one delivery attempt.
///
/// Asynchronous delivery receipts are out of scope; this is the only
/// feedback the engine consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The provider accepted the message and assigned it an id.
    Delivered { external_message_id: String },
    /// The provider rejected the attempt.
    Rejected {
        category: ErrorCategory,
        /// Provider error code, retained for diagnostics.
        code: String,
        message: Option<String>,
    },
}

impl SendOutcome {
    pub fn rejected(category: ErrorCategory, code: impl Into<String>) -> Self {
        Self::Rejected {
            category,
            code: code.into(),
            message: None,
        }
    }

    /// Error code string stored on the entry, e.g. `transient:network`.
    pub fn error_code(&self) -> Option<String> {
        match self {
            Self::Delivered { .. } => None,
            Self::Rejected { category, code, .. } => {
                Some(format!("{}:{}", category.as_str(), code))
            }
        }
    }
}

/// One message as handed to a gateway.
#[derive(Debug, Clone, Copy)]
pub struct OutboundMessage<'a> {
    pub entry_id: &'a str,
    pub channel_id: &'a str,
    pub recipient: &'a str,
    pub payload: &'a serde_json::Value,
}

/// Abstraction over the outbound call to the messaging provider.
///
/// Implementations must fold transport failures into
/// [`SendOutcome::Rejected`] with [`ErrorCategory::Transient`] where
/// possible; a `GatewayError` escaping here is treated the same way by
/// the dispatcher but loses the provider code.
#[async_trait]
pub trait SendGateway: Send + Sync {
    async fn send(&self, message: OutboundMessage<'_>) -> GatewayResult<SendOutcome>;
}
