//! Error types for the transport module.

use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Invalid stream URL.
    #[error("Invalid stream URL: {0}")]
    InvalidUrl(String),

    /// The connection could not be established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A send on an established session failed.
    #[error("Send error: {0}")]
    Send(String),

    /// The session was closed or never opened.
    #[error("Not connected")]
    NotConnected,

    /// A network operation exceeded its deadline.
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// RTMP protocol error.
    #[error("RTMP protocol error: {0}")]
    Protocol(String),
}
