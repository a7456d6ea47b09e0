//! Engine error types.

use thiserror::Error;

/// Engine error type.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Queue store error
    #[error("Database error: {0}")]
    Database(#[from] courier_database::DatabaseError),

    /// Gateway error
    #[error("Gateway error: {0}")]
    Gateway(#[from] courier_gateway::GatewayError),

    /// Referenced record is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Dispatch task failed to complete
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type alias using EngineError.
pub type EngineResult<T> = Result<T, EngineError>;
