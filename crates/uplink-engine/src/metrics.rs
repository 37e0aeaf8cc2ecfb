//! Stream counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use uplink_encoder::MediaKind;
use uplink_ipc::StreamMetrics;

/// Counts what happens to frames between the encoder and the transport.
///
/// Queue overflow counters live on the queues themselves.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    start_time: RwLock<Option<Instant>>,
    video_frames_sent: AtomicU64,
    audio_frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_errors: AtomicU64,
    reconnects: AtomicU64,
    heartbeat_frames: AtomicU64,
    idle_frames: AtomicU64,
    gated_frames: AtomicU64,
    discarded_frames: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of a streaming attempt.
    pub fn start(&self) {
        *self.start_time.write() = Some(Instant::now());
    }

    pub fn stop(&self) {
        *self.start_time.write() = None;
    }

    pub fn record_sent(&self, kind: MediaKind, bytes: usize) {
        let counter = match kind {
            MediaKind::Video => &self.video_frames_sent,
            MediaKind::Audio => &self.audio_frames_sent,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat(&self, bytes: usize) {
        self.heartbeat_frames.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Frame arrived while not streaming.
    pub fn record_idle_frame(&self) {
        self.idle_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Delta frame held back by the resolution gate.
    pub fn record_gated_frame(&self) {
        self.gated_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Queued frames thrown away by a reconnect or stop.
    pub fn record_discarded(&self, count: usize) {
        self.discarded_frames.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn heartbeat_frames(&self) -> u64 {
        self.heartbeat_frames.load(Ordering::Relaxed)
    }

    pub fn gated_frames(&self) -> u64 {
        self.gated_frames.load(Ordering::Relaxed)
    }

    /// Snapshot of the collector's own counters.
    ///
    /// Queue and adaptation fields are left at their defaults for the caller
    /// to fill in.
    pub fn snapshot(&self) -> StreamMetrics {
        let uptime_seconds = self
            .start_time
            .read()
            .map(|start| start.elapsed().as_secs())
            .unwrap_or(0);

        StreamMetrics {
            video_frames_sent: self.video_frames_sent.load(Ordering::Relaxed),
            audio_frames_sent: self.audio_frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            gated_frames: self.gated_frames.load(Ordering::Relaxed),
            idle_frames: self.idle_frames.load(Ordering::Relaxed),
            discarded_frames: self.discarded_frames.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            heartbeat_frames: self.heartbeat_frames.load(Ordering::Relaxed),
            uptime_seconds,
            ..StreamMetrics::default()
        }
    }
}
