//! Coarse stream status as seen by the host.

use serde::{Deserialize, Serialize};

/// Status transitions surfaced to the host application.
///
/// Fine-grained retry and adaptation behavior stays inside the engine; the
/// host only ever observes these five states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StreamStatus {
    /// Opening the transport session.
    Connecting,

    /// Connected and streaming.
    Connected,

    /// A send failed and the session is being re-established.
    Reconnecting,

    /// The session could not be re-established. Terminal until stopped.
    Failed {
        /// Human-readable failure reason.
        reason: String,
    },

    /// Streaming stopped.
    Stopped,
}

impl StreamStatus {
    /// Returns true if the host should consider the stream live.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connected | Self::Reconnecting)
    }

    /// Returns true for the terminal failure status.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Returns the wire name of this status.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed { .. } => "failed",
            Self::Stopped => "stopped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_names_match_wire_format() {
        let failed = StreamStatus::Failed {
            reason: "refused".to_string(),
        };
        let json = serde_json::to_string(&failed).unwrap();
        assert_eq!(json, r#"{"status":"failed","reason":"refused"}"#);
        assert_eq!(failed.name(), "failed");

        let json = serde_json::to_string(&StreamStatus::Reconnecting).unwrap();
        assert_eq!(json, r#"{"status":"reconnecting"}"#);
    }

    #[test]
    fn test_status_predicates() {
        assert!(StreamStatus::Connected.is_live());
        assert!(StreamStatus::Reconnecting.is_live());
        assert!(!StreamStatus::Stopped.is_live());
        assert!(StreamStatus::Failed {
            reason: String::new()
        }
        .is_failed());
    }
}
