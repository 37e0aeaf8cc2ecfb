//! Encoded frame types.

use bytes::Bytes;
use std::time::{Duration, Instant};

use crate::nal;

/// Media type of an encoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

/// One encoded unit handed over by the encoder.
///
/// The payload is owned: frames built from borrowed encoder buffers go
/// through [`EncodedFrame::copy_from_slice`] so the encoder may reuse its
/// memory as soon as the callback returns.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Video or audio.
    pub kind: MediaKind,

    /// Encoded payload (Annex B access unit for video, raw AAC for audio).
    pub payload: Bytes,

    /// Presentation timestamp in microseconds since stream start.
    pub timestamp_us: u64,

    /// True if the frame is decodable on its own (IDR).
    pub is_key_unit: bool,
}

impl EncodedFrame {
    /// Create a video frame.
    pub fn video(payload: Bytes, timestamp_us: u64, is_key_unit: bool) -> Self {
        Self {
            kind: MediaKind::Video,
            payload,
            timestamp_us,
            is_key_unit,
        }
    }

    /// Create an audio frame. Audio frames are never key units.
    pub fn audio(payload: Bytes, timestamp_us: u64) -> Self {
        Self {
            kind: MediaKind::Audio,
            payload,
            timestamp_us,
            is_key_unit: false,
        }
    }

    /// Create a frame that owns a copy of a borrowed encoder buffer.
    pub fn copy_from_slice(
        kind: MediaKind,
        data: &[u8],
        timestamp_us: u64,
        is_key_unit: bool,
    ) -> Self {
        Self {
            kind,
            payload: Bytes::copy_from_slice(data),
            timestamp_us,
            is_key_unit: is_key_unit && kind == MediaKind::Video,
        }
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }

    /// Copy the payload into a fresh allocation.
    ///
    /// `Bytes::clone` shares the backing buffer; snapshots that outlive the
    /// frame (the heartbeat frame) must not.
    pub fn deep_copy(&self) -> Self {
        Self {
            payload: Bytes::copy_from_slice(&self.payload),
            ..self.clone()
        }
    }
}

/// H.264 parameter sets the decoder needs before any frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecConfig {
    /// Sequence parameter set, without start code.
    pub sps: Bytes,

    /// Picture parameter set, without start code.
    pub pps: Bytes,
}

impl CodecConfig {
    /// Build a config from borrowed parameter sets (copied).
    pub fn new(sps: &[u8], pps: &[u8]) -> Self {
        Self {
            sps: Bytes::copy_from_slice(sps),
            pps: Bytes::copy_from_slice(pps),
        }
    }

    /// Extract SPS/PPS from an Annex B header blob.
    pub fn from_annex_b(data: &[u8]) -> Option<Self> {
        nal::extract_sps_pps(data).map(|(sps, pps)| Self { sps, pps })
    }

    /// SPS and PPS joined with 4-byte start codes.
    pub fn annex_b(&self) -> Bytes {
        nal::join_annex_b([self.sps.as_ref(), self.pps.as_ref()])
    }
}

/// Monotonic clock anchored at stream start.
#[derive(Debug, Clone, Copy)]
pub struct StreamClock {
    start: Instant,
}

impl StreamClock {
    /// Start a clock at the current instant.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Microseconds since the clock started.
    pub fn now_us(&self) -> u64 {
        self.elapsed().as_micros() as u64
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for StreamClock {
    fn default() -> Self {
        Self::start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_frames_are_never_key_units() {
        let frame = EncodedFrame::copy_from_slice(MediaKind::Audio, &[1, 2, 3], 10, true);
        assert!(!frame.is_key_unit);
        assert_eq!(frame.size(), 3);
        assert!(!frame.is_video());
    }

    #[test]
    fn test_deep_copy_does_not_share_buffer() {
        let frame = EncodedFrame::video(Bytes::from_static(&[0, 0, 0, 1, 0x65]), 40, true);
        let copy = frame.deep_copy();
        assert_eq!(copy.payload, frame.payload);
        assert_ne!(copy.payload.as_ptr(), frame.payload.as_ptr());
        assert_eq!(copy.timestamp_us, 40);
        assert!(copy.is_key_unit);
    }

    #[test]
    fn test_codec_config_annex_b() {
        let config = CodecConfig::new(&[0x67, 0x42], &[0x68, 0xCE]);
        assert_eq!(
            config.annex_b().as_ref(),
            &[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xCE]
        );
        assert_eq!(CodecConfig::from_annex_b(&config.annex_b()), Some(config));
    }

    #[test]
    fn test_stream_clock_is_monotonic() {
        let clock = StreamClock::start();
        let a = clock.now_us();
        let b = clock.now_us();
        assert!(b >= a);
    }
}
