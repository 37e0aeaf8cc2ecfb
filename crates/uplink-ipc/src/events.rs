//! Events sent from the engine to the host.

use serde::{Deserialize, Serialize};

use crate::state::StreamStatus;
use crate::types::StreamMetrics;

/// Events that the engine can send to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// Coarse session status changed.
    Status(StreamStatus),

    /// The adaptation logic selected a new capture/encode resolution.
    ResolutionChanged {
        /// New width in pixels.
        width: u32,

        /// New height in pixels.
        height: u32,
    },

    /// The target video bitrate changed.
    BitrateChanged {
        /// New bitrate in bits per second.
        bitrate: u32,
    },

    /// Updated stream metrics.
    Metrics(StreamMetrics),

    /// Engine has shut down.
    Shutdown,
}
