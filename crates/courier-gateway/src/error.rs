//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
///
/// Provider rejections are *not* errors - they come back as
/// [`crate::SendOutcome::Rejected`] so the dispatcher sees a single
/// taxonomy. This type covers failures of the gateway itself.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed provider response
    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    /// Gateway misconfiguration
    #[error("Gateway configuration error: {0}")]
    Config(String),
}

/// Result type alias using GatewayError.
pub type GatewayResult<T> = Result<T, GatewayError>;
