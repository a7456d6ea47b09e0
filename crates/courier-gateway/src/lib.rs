//! Send gateway abstraction for the dispatch engine.
//!
//! Defines the outcome taxonomy every provider must map into, the
//! [`SendGateway`] trait the dispatcher sends through, the centralized
//! retry/backoff policy, and the operator notification seam. The one
//! concrete transport is [`HttpGateway`], a reqwest client for an
//! HTTP messaging provider.

mod backoff;
mod clock;
mod error;
mod http;
mod notify;
mod outcome;

pub use backoff::{backoff_delay, RetryDecision, RetryPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{GatewayError, GatewayResult};
pub use http::{HttpGateway, HttpGatewayConfig};
pub use notify::{Alert, LogNotifier, Notifier};
pub use outcome::{ErrorCategory, OutboundMessage, SendGateway, SendOutcome};
