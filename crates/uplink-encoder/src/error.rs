//! Error types for the encoder module.

use thiserror::Error;

/// Errors that can occur at the encoder boundary.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// Invalid input data.
    #[error("Invalid input data: {0}")]
    InvalidInput(String),

    /// The bitstream carries no SPS/PPS, so no codec config can be derived.
    #[error("No SPS/PPS found in bitstream")]
    MissingParameterSets,

    /// Encoder not initialized.
    #[error("Encoder not initialized")]
    NotInitialized,

    /// Encoder already running.
    #[error("Encoder already running")]
    AlreadyRunning,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
