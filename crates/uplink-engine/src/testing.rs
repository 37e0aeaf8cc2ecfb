//! In-memory transport and encoder for tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use uplink_encoder::{CodecConfig, EncodedFrame, EncodedSink, EncoderControl};
use uplink_transport::{
    NetworkStats, SessionMetadata, TransportConnector, TransportError, TransportResult,
    TransportSession,
};

use crate::config::EngineConfig;

/// One call recorded by a [`FakeSession`].
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Video { timestamp_us: u64, is_key_unit: bool },
    Audio { timestamp_us: u64 },
    Config,
    Metadata(SessionMetadata),
}

/// Shared record of one fake session.
#[derive(Debug, Default)]
pub struct SessionLog {
    sent: Mutex<Vec<Sent>>,
    pub fail_sends: AtomicBool,
    /// Every call blocks this long first, like a congested link.
    pub send_delay_ms: AtomicU64,
    pub closed: AtomicBool,
    pub stats: Mutex<NetworkStats>,
}

impl SessionLog {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn video_timestamps(&self) -> Vec<u64> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Video { timestamp_us, .. } => Some(*timestamp_us),
                _ => None,
            })
            .collect()
    }

    pub fn config_count(&self) -> usize {
        self.sent.lock().iter().filter(|s| **s == Sent::Config).count()
    }

    fn record(&self, sent: Sent) -> TransportResult<()> {
        let delay = self.send_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send("injected failure".into()));
        }
        self.sent.lock().push(sent);
        Ok(())
    }
}

struct FakeSession {
    log: Arc<SessionLog>,
}

impl TransportSession for FakeSession {
    fn send_video(
        &mut self,
        _payload: &[u8],
        timestamp_us: u64,
        is_key_unit: bool,
    ) -> TransportResult<()> {
        self.log.record(Sent::Video {
            timestamp_us,
            is_key_unit,
        })
    }

    fn send_audio(&mut self, _payload: &[u8], timestamp_us: u64) -> TransportResult<()> {
        self.log.record(Sent::Audio { timestamp_us })
    }

    fn send_codec_config(&mut self, _config: &CodecConfig) -> TransportResult<()> {
        self.log.record(Sent::Config)
    }

    fn set_metadata(&mut self, metadata: &SessionMetadata) -> TransportResult<()> {
        self.log.record(Sent::Metadata(*metadata))
    }

    fn stats(&self) -> Option<NetworkStats> {
        if self.log.closed.load(Ordering::SeqCst) {
            return None;
        }
        Some(*self.log.stats.lock())
    }

    fn close(&mut self) {
        self.log.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector handing out [`FakeSession`]s and keeping their logs.
#[derive(Debug, Default)]
pub struct FakeConnector {
    sessions: Mutex<Vec<Arc<SessionLog>>>,
    pub refuse: AtomicBool,
    /// `open` blocks this long first.
    pub open_delay_ms: AtomicU64,
}

impl FakeConnector {
    pub fn opens(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn session(&self, index: usize) -> Arc<SessionLog> {
        Arc::clone(&self.sessions.lock()[index])
    }
}

impl TransportConnector for FakeConnector {
    fn open(&self, _url: &str) -> TransportResult<Box<dyn TransportSession>> {
        let delay = self.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("refused".into()));
        }
        let log = Arc::new(SessionLog::default());
        self.sessions.lock().push(Arc::clone(&log));
        Ok(Box::new(FakeSession { log }))
    }
}

/// Encoder that records commands and lets the test push output.
#[derive(Default)]
pub struct FakeEncoder {
    sink: Mutex<Option<Weak<dyn EncodedSink>>>,
    pub key_requests: AtomicU64,
    bitrates: Mutex<Vec<u32>>,
}

impl FakeEncoder {
    pub fn bitrates(&self) -> Vec<u32> {
        self.bitrates.lock().clone()
    }

    /// Deliver a frame through the registered sink, as the encoder thread would.
    pub fn emit(&self, frame: EncodedFrame) {
        let sink = self.sink.lock().as_ref().and_then(Weak::upgrade);
        if let Some(sink) = sink {
            sink.on_encoded_frame(frame);
        }
    }

    pub fn emit_config(&self) {
        let sink = self.sink.lock().as_ref().and_then(Weak::upgrade);
        if let Some(sink) = sink {
            sink.on_codec_config(CodecConfig::new(&[0x67, 0x42], &[0x68, 0xce]));
        }
    }
}

impl EncoderControl for FakeEncoder {
    fn set_sink(&self, sink: Weak<dyn EncodedSink>) {
        *self.sink.lock() = Some(sink);
    }

    fn request_key_unit(&self) {
        self.key_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn update_bitrate(&self, bitrate: u32) {
        self.bitrates.lock().push(bitrate);
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

pub fn video(timestamp_us: u64, is_key_unit: bool) -> EncodedFrame {
    EncodedFrame::video(
        Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88]),
        timestamp_us,
        is_key_unit,
    )
}

pub fn audio(timestamp_us: u64) -> EncodedFrame {
    EncodedFrame::audio(Bytes::from_static(&[0x21, 0x10]), timestamp_us)
}

/// Short timings so reconnect and heartbeat tests run quickly.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.queues.poll_timeout_ms = 10;
    config.reconnect.settle_ms = 50;
    config.reconnect.join_timeout_ms = 1000;
    config.heartbeat.interval_ms = 100;
    config
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
