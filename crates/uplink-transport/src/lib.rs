//! Transport boundary for the uplink engine.
//!
//! The engine talks to the network through [`TransportSession`], one open
//! connection to the ingest server, obtained from a [`TransportConnector`].
//! [`RtmpConnector`] is the production adapter: it publishes FLV-packaged
//! H.264/AAC over RTMP.

mod connection;
mod error;
pub mod flv;
mod rtmp;

pub use connection::RtmpEndpoint;
pub use error::TransportError;
pub use rtmp::{RtmpConnector, RtmpSession};

use serde::{Deserialize, Serialize};
use uplink_encoder::CodecConfig;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Network statistics snapshot for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    /// Cumulative payload bytes written.
    pub bytes_sent: u64,

    /// Smoothed send delay in milliseconds.
    pub delay_ms: u32,

    /// Packet loss percentage (0-100).
    pub packet_loss_percent: u32,

    /// Cumulative frames the session rejected or lost.
    pub dropped_frames: u64,
}

/// Stream description announced to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub width: u32,
    pub height: u32,
    /// Video bitrate in bits per second.
    pub video_bitrate: u32,
    pub fps: u32,
    pub audio_sample_rate: u32,
    pub audio_channels: u32,
}

/// One open connection to the server.
///
/// A session is used by one thread at a time; the engine serializes access.
/// Any error from a send means the session should be replaced.
pub trait TransportSession: Send {
    /// Send one Annex B video access unit.
    fn send_video(&mut self, payload: &[u8], timestamp_us: u64, is_key_unit: bool)
        -> TransportResult<()>;

    /// Send one raw AAC frame.
    fn send_audio(&mut self, payload: &[u8], timestamp_us: u64) -> TransportResult<()>;

    /// Send decoder configuration ahead of the frames that depend on it.
    fn send_codec_config(&mut self, config: &CodecConfig) -> TransportResult<()> {
        self.send_video(&config.annex_b(), 0, true)
    }

    /// Announce stream geometry and rates.
    fn set_metadata(&mut self, metadata: &SessionMetadata) -> TransportResult<()>;

    /// Current statistics, or `None` if the session cannot report yet.
    fn stats(&self) -> Option<NetworkStats>;

    /// Close the connection. Further sends fail with `NotConnected`.
    fn close(&mut self);
}

/// Factory for transport sessions.
pub trait TransportConnector: Send + Sync {
    /// Open a new session against `url`.
    fn open(&self, url: &str) -> TransportResult<Box<dyn TransportSession>>;
}
