//! Annex B file replay encoder.
//!
//! Plays back a pre-encoded H.264 elementary stream at a fixed frame rate,
//! standing in for a live platform encoder.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace, warn};

use crate::frame::{CodecConfig, EncodedFrame};
use crate::nal::{self, AccessUnit};
use crate::{EncodedSink, EncoderControl, EncoderError, EncoderResult};

/// Replay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Output frame rate.
    pub fps: u32,

    /// Restart from the first access unit at end of file.
    pub looping: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            looping: true,
        }
    }
}

/// A prepared access unit: parameter sets stripped, Annex B payload.
#[derive(Debug, Clone)]
struct ReplayUnit {
    payload: Bytes,
    is_key_unit: bool,
}

impl ReplayUnit {
    fn from_access_unit(unit: &AccessUnit) -> Option<Self> {
        let nals = nal::filter_parameter_sets(unit.nals.clone());
        if nals.is_empty() {
            return None;
        }
        Some(Self {
            payload: nal::join_annex_b(nals.iter().map(|n| n.data.as_ref())),
            is_key_unit: unit.is_key_unit(),
        })
    }
}

struct ReplayShared {
    config: ReplayConfig,
    codec_config: CodecConfig,
    units: Vec<ReplayUnit>,
    sink: Mutex<Option<Weak<dyn EncodedSink>>>,
    running: AtomicBool,
    key_unit_requested: AtomicBool,
    bitrate: AtomicU32,
}

/// Encoder that replays an Annex B H.264 stream.
pub struct AnnexBReplayEncoder {
    shared: Arc<ReplayShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AnnexBReplayEncoder {
    /// Load an Annex B file.
    pub fn from_path(path: impl AsRef<Path>, config: ReplayConfig) -> EncoderResult<Self> {
        let data = std::fs::read(path.as_ref())?;
        info!(path = %path.as_ref().display(), bytes = data.len(), "Loaded H.264 stream");
        Self::from_bytes(&data, config)
    }

    /// Build from an in-memory Annex B stream.
    ///
    /// The stream must carry SPS/PPS and at least one IDR picture.
    pub fn from_bytes(data: &[u8], config: ReplayConfig) -> EncoderResult<Self> {
        if config.fps == 0 {
            return Err(EncoderError::InvalidInput("fps must be positive".into()));
        }

        let codec_config =
            CodecConfig::from_annex_b(data).ok_or(EncoderError::MissingParameterSets)?;

        let access_units = nal::split_access_units(nal::parse_annex_b(data));
        let units: Vec<ReplayUnit> = access_units
            .iter()
            .filter_map(ReplayUnit::from_access_unit)
            .collect();

        if !units.iter().any(|u| u.is_key_unit) {
            return Err(EncoderError::InvalidInput(
                "stream contains no IDR picture".into(),
            ));
        }

        debug!(
            units = units.len(),
            key_units = units.iter().filter(|u| u.is_key_unit).count(),
            "Prepared replay stream"
        );

        Ok(Self {
            shared: Arc::new(ReplayShared {
                config,
                codec_config,
                units,
                sink: Mutex::new(None),
                running: AtomicBool::new(false),
                key_unit_requested: AtomicBool::new(false),
                bitrate: AtomicU32::new(0),
            }),
            thread: Mutex::new(None),
        })
    }

    /// Number of access units in the stream.
    pub fn len(&self) -> usize {
        self.shared.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.units.is_empty()
    }

    /// Last bitrate requested through [`EncoderControl::update_bitrate`].
    pub fn requested_bitrate(&self) -> u32 {
        self.shared.bitrate.load(Ordering::Relaxed)
    }

    /// Start emitting codec config and frames on a dedicated thread.
    #[instrument(name = "replay_start", skip(self))]
    pub fn start(&self) -> EncoderResult<()> {
        if self.shared.sink.lock().is_none() {
            return Err(EncoderError::NotInitialized);
        }
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(EncoderError::AlreadyRunning);
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("replay-encoder".into())
            .spawn(move || replay_loop(shared))?;

        *self.thread.lock() = Some(handle);
        info!(fps = self.shared.config.fps, "Replay encoder started");
        Ok(())
    }

    /// Stop the replay thread. Idempotent.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
            info!("Replay encoder stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

impl EncoderControl for AnnexBReplayEncoder {
    fn set_sink(&self, sink: Weak<dyn EncodedSink>) {
        *self.shared.sink.lock() = Some(sink);
    }

    fn request_key_unit(&self) {
        debug!("Key unit requested");
        self.shared.key_unit_requested.store(true, Ordering::SeqCst);
    }

    fn update_bitrate(&self, bitrate: u32) {
        // A recorded stream cannot change rate; remember the request only.
        info!(bitrate, "Bitrate update requested");
        self.shared.bitrate.store(bitrate, Ordering::Relaxed);
    }

    fn name(&self) -> &'static str {
        "annexb-replay"
    }
}

impl Drop for AnnexBReplayEncoder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Index of the next key unit at or after `from`, wrapping around.
fn next_key_unit(units: &[ReplayUnit], from: usize) -> usize {
    let len = units.len();
    (0..len)
        .map(|offset| (from + offset) % len)
        .find(|&i| units[i].is_key_unit)
        .unwrap_or(from)
}

fn current_sink(shared: &ReplayShared) -> Option<Arc<dyn EncodedSink>> {
    shared.sink.lock().as_ref().and_then(Weak::upgrade)
}

fn replay_loop(shared: Arc<ReplayShared>) {
    let frame_interval = Duration::from_micros(1_000_000 / u64::from(shared.config.fps));
    let mut index = 0usize;
    let mut emitted: u64 = 0;
    let mut next_deadline = Instant::now();

    match current_sink(&shared) {
        Some(sink) => sink.on_codec_config(shared.codec_config.clone()),
        None => {
            warn!("Sink dropped before replay started");
            shared.running.store(false, Ordering::SeqCst);
            return;
        }
    }

    while shared.running.load(Ordering::SeqCst) {
        if index >= shared.units.len() {
            if !shared.config.looping {
                info!(emitted, "End of stream");
                break;
            }
            index = 0;
        }

        if shared.key_unit_requested.swap(false, Ordering::SeqCst) {
            let key = next_key_unit(&shared.units, index);
            trace!(from = index, to = key, "Skipping to key unit");
            index = key;
        }

        let unit = &shared.units[index];
        let timestamp_us = emitted * 1_000_000 / u64::from(shared.config.fps);

        let Some(sink) = current_sink(&shared) else {
            debug!("Sink dropped, stopping replay");
            break;
        };
        sink.on_encoded_frame(EncodedFrame::video(
            unit.payload.clone(),
            timestamp_us,
            unit.is_key_unit,
        ));
        drop(sink);

        if unit.is_key_unit || emitted % 30 == 0 {
            debug!(emitted, key = unit.is_key_unit, "Replayed frame");
        }

        index += 1;
        emitted += 1;

        next_deadline += frame_interval;
        let now = Instant::now();
        if next_deadline > now {
            thread::sleep(next_deadline - now);
        } else {
            next_deadline = now;
        }
    }

    shared.running.store(false, Ordering::SeqCst);
}
