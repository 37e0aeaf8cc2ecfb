//! Commands sent from the host to the engine.

use serde::{Deserialize, Serialize};

/// Commands that the host application can send to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HostCommand {
    /// Start streaming.
    Start,

    /// Stop the current stream.
    Stop,

    /// Manually override the video bitrate (bps). Clamped like automatic changes.
    SetBitrate(u32),

    /// The host application moved to the background.
    EnterBackground,

    /// The host application returned to the foreground.
    EnterForeground,

    /// Request a metrics snapshot.
    GetMetrics,

    /// Shutdown the engine completely.
    Shutdown,
}
