//! Encoder boundary for the uplink engine.
//!
//! The platform encoder is an external collaborator. This crate defines the
//! values it produces ([`EncodedFrame`], [`CodecConfig`]), the callback
//! target it pushes them into ([`EncodedSink`]) and the commands the engine
//! sends back ([`EncoderControl`]). It also ships an Annex B replay encoder
//! used by the `uplink` binary and by tests.

mod error;
mod frame;
pub mod nal;
mod replay;

pub use error::EncoderError;
pub use frame::{CodecConfig, EncodedFrame, MediaKind, StreamClock};
pub use replay::{AnnexBReplayEncoder, ReplayConfig};

use std::sync::Weak;

/// Result type for encoder operations.
pub type EncoderResult<T> = Result<T, EncoderError>;

/// Receiver of encoder output.
///
/// Called from the encoder's own thread; implementations must not block.
pub trait EncodedSink: Send + Sync {
    /// One encoded access unit (video) or packet (audio).
    fn on_encoded_frame(&self, frame: EncodedFrame);

    /// New parameter sets, replacing any previous ones.
    fn on_codec_config(&self, config: CodecConfig);
}

/// Commands the engine issues to a running encoder.
pub trait EncoderControl: Send + Sync {
    /// Register the callback target. The encoder holds it weakly so the
    /// sink's owner controls its lifetime.
    fn set_sink(&self, sink: Weak<dyn EncodedSink>);

    /// Force the next output to be a key unit.
    fn request_key_unit(&self);

    /// Change the target bitrate without reinitializing.
    fn update_bitrate(&self, bitrate: u32);

    /// Encoder name for logging.
    fn name(&self) -> &'static str;
}
