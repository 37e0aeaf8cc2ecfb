//! Error types for the engine.

use thiserror::Error;
use uplink_transport::TransportError;

use crate::config::ConfigError;

/// Errors surfaced to the host.
///
/// Send failures and overflow never appear here; they are absorbed by
/// reconnection and the queue policies.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The transport session could not be opened.
    #[error("Failed to open transport: {0}")]
    Init(#[source] TransportError),

    /// Configuration rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Operation not valid in the current session state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
