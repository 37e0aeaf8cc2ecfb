//! Session state machine.

use uplink_ipc::StreamStatus;

/// Lifecycle of one streaming session.
///
/// `Idle -> Connecting -> Streaming -> {Reconnecting <-> Streaming} -> Stopped`.
/// `Failed` is entered when a reconnect cannot reopen the transport and is
/// left only through `stop()`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamSessionState {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Failed {
        reason: String,
    },
    Stopped,
}

impl StreamSessionState {
    /// True while encoder output should be queued.
    pub fn accepts_frames(&self) -> bool {
        matches!(self, Self::Streaming | Self::Reconnecting)
    }

    /// True while senders may pull from the queues.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming)
    }

    /// True between `start()` and `stop()` unless reconnection failed.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Streaming | Self::Reconnecting)
    }

    pub fn can_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Stopped)
    }

    /// Coarse status reported to the host.
    pub fn status(&self) -> StreamStatus {
        match self {
            Self::Idle | Self::Stopped => StreamStatus::Stopped,
            Self::Connecting => StreamStatus::Connecting,
            Self::Streaming => StreamStatus::Connected,
            Self::Reconnecting => StreamStatus::Reconnecting,
            Self::Failed { reason } => StreamStatus::Failed {
                reason: reason.clone(),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Reconnecting => "reconnecting",
            Self::Failed { .. } => "failed",
            Self::Stopped => "stopped",
        }
    }
}
