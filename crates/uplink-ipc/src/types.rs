//! Common types used across host messages.

use serde::{Deserialize, Serialize};

/// Configuration for starting a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Publish URL (e.g., "rtmp://live.example.com/app/stream-key").
    pub url: String,

    /// Initial video width in pixels.
    pub width: u32,

    /// Initial video height in pixels.
    pub height: u32,

    /// Video frames per second.
    pub fps: u32,

    /// Requested video bitrate in bps. Also the ceiling for automatic recovery.
    pub video_bitrate: u32,

    /// Audio sample rate in Hz (0 for no audio).
    pub audio_sample_rate: u32,

    /// Audio channel count.
    pub audio_channels: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            width: 1920,
            height: 1080,
            fps: 30,
            video_bitrate: 2_000_000,
            audio_sample_rate: 44_100,
            audio_channels: 1,
        }
    }
}

/// Real-time stream metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMetrics {
    /// Video frames handed to the transport.
    pub video_frames_sent: u64,

    /// Audio frames handed to the transport.
    pub audio_frames_sent: u64,

    /// Payload bytes handed to the transport.
    pub bytes_sent: u64,

    /// Video frames dropped by queue overflow.
    pub video_frames_dropped: u64,

    /// Audio frames dropped by queue overflow.
    pub audio_frames_dropped: u64,

    /// Video frames discarded while waiting for a key unit after a level change.
    pub gated_frames: u64,

    /// Frames received while not streaming.
    pub idle_frames: u64,

    /// Queued frames discarded by reconnect or stop.
    pub discarded_frames: u64,

    /// Failed transport sends.
    pub send_errors: u64,

    /// Completed reconnections.
    pub reconnects: u64,

    /// Frames sent by the background heartbeat.
    pub heartbeat_frames: u64,

    /// Frames currently waiting in the video queue.
    pub video_queue_len: usize,

    /// Frames currently waiting in the audio queue.
    pub audio_queue_len: usize,

    /// Current target bitrate in bps.
    pub bitrate: u32,

    /// Current quality level index (0 = best).
    pub level: usize,

    /// Stream uptime in seconds.
    pub uptime_seconds: u64,
}
