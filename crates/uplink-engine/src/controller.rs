//! Streaming session controller.
//!
//! Frames arrive from the encoder thread through [`EncodedSink`], wait in
//! one bounded queue per media type and are written to the transport by one
//! sender thread per queue. A failed send replaces the transport session in
//! place; the host sees `reconnecting` and then `connected` again.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, trace, warn};
use uplink_encoder::{CodecConfig, EncodedFrame, EncodedSink, EncoderControl, MediaKind, StreamClock};
use uplink_ipc::{StreamEvent, StreamMetrics};
use uplink_transport::{
    NetworkStats, SessionMetadata, TransportConnector, TransportError, TransportResult,
    TransportSession,
};

use crate::abr::LinkMonitor;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::gate::ResolutionGate;
use crate::metrics::MetricsCollector;
use crate::queue::BoundedFrameQueue;
use crate::state::StreamSessionState;

/// A send that failed on the session of the given generation.
type SendFailure = (u64, TransportError);

struct Shared {
    url: String,
    connector: Arc<dyn TransportConnector>,
    encoder: Arc<dyn EncoderControl>,
    config: EngineConfig,

    session: Mutex<Option<Box<dyn TransportSession>>>,
    /// Last stats read from the session. Sends hold the session lock for as
    /// long as the network takes, so the adaptation thread reads this.
    link_stats: Mutex<Option<NetworkStats>>,
    /// Bumped every time a new session is installed.
    generation: AtomicU64,

    state: RwLock<StreamSessionState>,
    running: AtomicBool,
    reconnecting: AtomicBool,

    video_queue: BoundedFrameQueue,
    audio_queue: BoundedFrameQueue,

    codec_config: Mutex<Option<CodecConfig>>,
    metadata: Mutex<Option<SessionMetadata>>,
    /// Owned copy of the newest queued video frame, for the heartbeat.
    last_video: Mutex<Option<EncodedFrame>>,
    last_video_ts: AtomicU64,

    gate: ResolutionGate,
    metrics: MetricsCollector,
    events: Sender<StreamEvent>,
    clock: RwLock<StreamClock>,
}

struct Heartbeat {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Owns one streaming session from `initialize` to drop.
pub struct StreamController {
    shared: Arc<Shared>,
    /// Sender threads. The lock also serializes `start` and `stop`.
    senders: Mutex<Vec<JoinHandle<()>>>,
    heartbeat: Mutex<Option<Heartbeat>>,
}

impl StreamController {
    /// Open the transport and register as the encoder's sink.
    ///
    /// Fails with [`EngineError::Init`] if the session cannot be opened.
    #[instrument(name = "stream_initialize", skip_all, fields(encoder = encoder.name()))]
    pub fn initialize(
        url: impl Into<String>,
        connector: Arc<dyn TransportConnector>,
        encoder: Arc<dyn EncoderControl>,
        config: EngineConfig,
        events: Sender<StreamEvent>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let url = url.into();
        let session = connector.open(&url).map_err(EngineError::Init)?;
        let link_stats = session.stats();

        let shared = Arc::new(Shared {
            url,
            connector,
            encoder,
            video_queue: BoundedFrameQueue::video(config.queues.video_capacity),
            audio_queue: BoundedFrameQueue::audio(config.queues.audio_capacity),
            config,
            session: Mutex::new(Some(session)),
            link_stats: Mutex::new(link_stats),
            generation: AtomicU64::new(1),
            state: RwLock::new(StreamSessionState::Idle),
            running: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            codec_config: Mutex::new(None),
            metadata: Mutex::new(None),
            last_video: Mutex::new(None),
            last_video_ts: AtomicU64::new(0),
            gate: ResolutionGate::new(),
            metrics: MetricsCollector::new(),
            events,
            clock: RwLock::new(StreamClock::start()),
        });

        let sink: Weak<dyn EncodedSink> = Arc::downgrade(&shared) as Weak<dyn EncodedSink>;
        shared.encoder.set_sink(sink);
        info!("Stream controller initialized");

        Ok(Self {
            shared,
            senders: Mutex::new(Vec::new()),
            heartbeat: Mutex::new(None),
        })
    }

    /// Begin streaming. Does nothing unless idle or stopped.
    ///
    /// A cached codec config is sent before this returns, so it precedes
    /// every queued frame.
    #[instrument(name = "stream_start", skip(self))]
    pub fn start(&self) -> EngineResult<()> {
        let mut senders = self.senders.lock();
        {
            let state = self.shared.state.read();
            if let StreamSessionState::Failed { reason } = &*state {
                return Err(EngineError::InvalidState(format!(
                    "stream failed ({reason}), stop before starting again"
                )));
            }
            if !state.can_start() {
                debug!(state = state.name(), "Already started, ignoring start");
                return Ok(());
            }
        }

        info!("Starting stream");
        self.shared.transition_to(StreamSessionState::Connecting);

        if let Err(e) = self.shared.prepare_session() {
            error!("Stream start failed: {}", e);
            self.shared.transition_to(StreamSessionState::Failed {
                reason: e.to_string(),
            });
            return Err(EngineError::Init(e));
        }

        *self.shared.clock.write() = StreamClock::start();
        self.shared.last_video_ts.store(0, Ordering::SeqCst);
        self.shared.metrics.start();
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.transition_to(StreamSessionState::Streaming);

        for kind in [MediaKind::Video, MediaKind::Audio] {
            let shared = Arc::clone(&self.shared);
            senders.push(thread::spawn(move || sender_loop(shared, kind)));
        }

        info!("Stream started");
        Ok(())
    }

    /// Stop streaming and close the session. Does nothing if already stopped.
    #[instrument(name = "stream_stop", skip(self))]
    pub fn stop(&self) {
        let mut senders = self.senders.lock();
        {
            let state = self.shared.state.read();
            if matches!(*state, StreamSessionState::Idle | StreamSessionState::Stopped) {
                debug!("Already stopped, ignoring stop");
                return;
            }
        }

        info!("Stopping stream");
        self.shared.running.store(false, Ordering::SeqCst);
        self.stop_heartbeat();
        self.shared.transition_to(StreamSessionState::Stopped);

        let deadline = Instant::now() + self.shared.config.reconnect.join_timeout();
        for handle in senders.drain(..) {
            join_until(handle, deadline, "Sender");
        }

        let discarded = self.shared.clear_queues();
        if let Some(mut session) = self.shared.session.lock().take() {
            session.close();
        }
        *self.shared.link_stats.lock() = None;
        self.shared.gate.clear();
        self.shared.metrics.stop();

        info!(discarded, "Stream stopped");
    }

    /// Frame from the encoder. Never blocks.
    pub fn on_encoded_frame(&self, frame: EncodedFrame) {
        self.shared.on_encoded_frame(frame);
    }

    /// Parameter sets from the encoder.
    pub fn on_codec_config(&self, config: CodecConfig) {
        self.shared.on_codec_config(config);
    }

    /// Cache stream metadata and announce it on the current session.
    pub fn set_metadata(&self, metadata: SessionMetadata) {
        *self.shared.metadata.lock() = Some(metadata);
        self.shared.apply_metadata(&metadata);
    }

    /// The capture pipeline finished switching resolution.
    pub fn on_resolution_changed(&self, width: u32, height: u32, bitrate: u32) {
        let updated = {
            let mut metadata = self.shared.metadata.lock();
            metadata.as_mut().map(|m| {
                m.width = width;
                m.height = height;
                m.video_bitrate = bitrate;
                *m
            })
        };

        match updated {
            Some(metadata) => {
                info!(width, height, bitrate, "Resolution change complete");
                self.shared.apply_metadata(&metadata);
            }
            None => debug!(width, height, "Resolution changed before metadata was set"),
        }
    }

    /// Keep the connection alive while the encoder may be suspended.
    pub fn enter_background(&self) {
        let mut heartbeat = self.heartbeat.lock();
        if heartbeat.is_some() {
            debug!("Heartbeat already running");
            return;
        }
        if !self.shared.state.read().is_streaming() {
            debug!("Not streaming, no heartbeat needed");
            return;
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || {
            let interval = shared.config.heartbeat.interval();
            debug!(?interval, "Heartbeat starting");
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                if !shared.running.load(Ordering::SeqCst) {
                    break;
                }
                if !shared.state.read().is_streaming() {
                    continue;
                }

                match panic::catch_unwind(AssertUnwindSafe(|| shared.send_heartbeat())) {
                    Ok(Ok(())) => {}
                    Ok(Err((generation, e))) => shared.handle_send_failure(generation, e),
                    Err(_) => error!("Heartbeat iteration panicked, continuing"),
                }
            }
            debug!("Heartbeat stopped");
        });

        *heartbeat = Some(Heartbeat { stop_tx, handle });
        info!("Entered background");
    }

    /// Stop the heartbeat and ask the encoder for a fresh key unit.
    pub fn enter_foreground(&self) {
        self.stop_heartbeat();
        if self.shared.state.read().is_streaming() {
            self.shared.encoder.request_key_unit();
        }
        info!("Entered foreground");
    }

    /// A heartbeat that hit a send failure may be inside a reconnect; it is
    /// detached if it does not exit within the join timeout.
    fn stop_heartbeat(&self) {
        let Some(heartbeat) = self.heartbeat.lock().take() else {
            return;
        };
        let _ = heartbeat.stop_tx.try_send(());
        let deadline = Instant::now() + self.shared.config.reconnect.join_timeout();
        join_until(heartbeat.handle, deadline, "Heartbeat");
    }

    pub fn state(&self) -> StreamSessionState {
        self.shared.state.read().clone()
    }

    /// True while connected and sending.
    pub fn is_streaming(&self) -> bool {
        self.shared.state.read().is_streaming()
    }

    pub fn is_backgrounded(&self) -> bool {
        self.heartbeat.lock().is_some()
    }

    pub fn is_gate_armed(&self) -> bool {
        self.shared.gate.is_armed()
    }

    /// Number of sessions installed so far.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Delivery-side view for the adaptation thread.
    pub fn link_monitor(&self) -> Arc<dyn LinkMonitor> {
        Arc::clone(&self.shared) as Arc<dyn LinkMonitor>
    }

    /// Counters plus queue depths. Adaptation fields are left at zero.
    pub fn metrics(&self) -> StreamMetrics {
        let shared = &self.shared;
        StreamMetrics {
            video_frames_dropped: shared.video_queue.dropped(),
            audio_frames_dropped: shared.audio_queue.dropped(),
            video_queue_len: shared.video_queue.len(),
            audio_queue_len: shared.audio_queue.len(),
            ..shared.metrics.snapshot()
        }
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Join `handle` if it finishes before `deadline`, otherwise detach it.
fn join_until(handle: JoinHandle<()>, deadline: Instant, name: &str) {
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    if !handle.is_finished() {
        warn!("{} thread did not exit in time, detaching", name);
        return;
    }
    if handle.join().is_err() {
        error!("{} thread panicked", name);
    }
}

fn sender_loop(shared: Arc<Shared>, kind: MediaKind) {
    debug!(kind = kind.as_str(), "Sender starting");
    let poll = shared.config.queues.poll_timeout();
    let queue = shared.queue(kind);

    while shared.running.load(Ordering::SeqCst) {
        if !shared.state.read().is_streaming() {
            thread::sleep(poll);
            continue;
        }
        let Some(frame) = queue.pop(poll) else {
            continue;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| shared.send_frame(&frame))) {
            Ok(Ok(())) => {}
            Ok(Err((generation, e))) => shared.handle_send_failure(generation, e),
            Err(_) => error!(kind = kind.as_str(), "Sender iteration panicked, continuing"),
        }
    }

    debug!(kind = kind.as_str(), "Sender stopped");
}

impl Shared {
    fn queue(&self, kind: MediaKind) -> &BoundedFrameQueue {
        match kind {
            MediaKind::Video => &self.video_queue,
            MediaKind::Audio => &self.audio_queue,
        }
    }

    fn transition_to(&self, next: StreamSessionState) {
        let previous = std::mem::replace(&mut *self.state.write(), next.clone());
        debug!(
            previous = previous.name(),
            current = next.name(),
            "State transition"
        );
        if previous.status() != next.status() {
            self.send_event(StreamEvent::Status(next.status()));
        }
    }

    /// Transition out of `Reconnecting`, unless `stop()` got there first.
    fn finish_reconnect(&self, next: StreamSessionState) -> bool {
        {
            let state = self.state.read();
            if *state != StreamSessionState::Reconnecting {
                debug!(state = state.name(), "Reconnect outcome superseded");
                return false;
            }
        }
        self.transition_to(next);
        true
    }

    fn send_event(&self, event: StreamEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }

    /// Make sure a session is open and has seen the cached config.
    fn prepare_session(&self) -> TransportResult<()> {
        let mut slot = self.session.lock();
        if slot.is_none() {
            let session = self.open_session()?;
            *self.link_stats.lock() = session.stats();
            *slot = Some(session);
            self.generation.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        let config = self.codec_config.lock().clone();
        if let (Some(session), Some(config)) = (slot.as_mut(), config) {
            session.send_codec_config(&config)?;
            info!("Sent cached codec config");
        }
        *self.link_stats.lock() = slot.as_ref().and_then(|s| s.stats());
        Ok(())
    }

    /// Open a session and replay cached metadata and codec config on it.
    fn open_session(&self) -> TransportResult<Box<dyn TransportSession>> {
        let mut session = self.connector.open(&self.url)?;

        let metadata = *self.metadata.lock();
        if let Some(metadata) = metadata {
            session.set_metadata(&metadata)?;
        }
        let config = self.codec_config.lock().clone();
        if let Some(config) = config {
            session.send_codec_config(&config)?;
            info!("Sent cached codec config");
        }
        Ok(session)
    }

    fn apply_metadata(&self, metadata: &SessionMetadata) {
        let result = match self.session.lock().as_mut() {
            Some(session) => session.set_metadata(metadata),
            None => return,
        };
        if let Err(e) = result {
            warn!("Failed to set metadata: {}", e);
        }
    }

    fn clear_queues(&self) -> usize {
        let discarded = self.video_queue.clear() + self.audio_queue.clear();
        self.metrics.record_discarded(discarded);
        discarded
    }

    fn send_frame(&self, frame: &EncodedFrame) -> Result<(), SendFailure> {
        let mut slot = self.session.lock();
        let generation = self.generation.load(Ordering::SeqCst);
        let Some(session) = slot.as_mut() else {
            return Err((generation, TransportError::NotConnected));
        };

        let result = match frame.kind {
            MediaKind::Video => {
                session.send_video(&frame.payload, frame.timestamp_us, frame.is_key_unit)
            }
            MediaKind::Audio => session.send_audio(&frame.payload, frame.timestamp_us),
        };
        *self.link_stats.lock() = session.stats();
        result.map_err(|e| (generation, e))?;

        self.metrics.record_sent(frame.kind, frame.size());
        if frame.is_video() {
            self.last_video_ts
                .fetch_max(frame.timestamp_us, Ordering::SeqCst);
        }
        Ok(())
    }

    fn send_heartbeat(&self) -> Result<(), SendFailure> {
        let Some(frame) = self.last_video.lock().clone() else {
            trace!("No video frame yet, heartbeat skipped");
            return Ok(());
        };

        let now_us = self.clock.read().now_us();
        let timestamp_us = now_us.max(self.last_video_ts.load(Ordering::SeqCst) + 1);

        let mut slot = self.session.lock();
        let generation = self.generation.load(Ordering::SeqCst);
        let Some(session) = slot.as_mut() else {
            return Err((generation, TransportError::NotConnected));
        };
        let result = session.send_video(&frame.payload, timestamp_us, frame.is_key_unit);
        *self.link_stats.lock() = session.stats();
        result.map_err(|e| (generation, e))?;

        self.last_video_ts.fetch_max(timestamp_us, Ordering::SeqCst);
        self.metrics.record_heartbeat(frame.size());
        trace!(ts = timestamp_us, "Heartbeat frame sent");
        Ok(())
    }

    fn handle_send_failure(&self, generation: u64, e: TransportError) {
        if self.reconnecting.load(Ordering::SeqCst) {
            trace!("Send failed during reconnect: {}", e);
            return;
        }
        self.metrics.record_send_error();
        self.reconnect(generation, &e);
    }

    /// Replace the session that failed. Runs on the thread that saw the
    /// failure; concurrent callers return immediately.
    fn reconnect(&self, failed_generation: u64, cause: &TransportError) {
        if self.generation.load(Ordering::SeqCst) != failed_generation {
            debug!("Session already replaced, ignoring stale failure");
            return;
        }
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Reconnect already in progress");
            return;
        }
        if self.generation.load(Ordering::SeqCst) != failed_generation
            || !self.running.load(Ordering::SeqCst)
        {
            self.reconnecting.store(false, Ordering::SeqCst);
            return;
        }

        warn!("Send failed, reconnecting: {}", cause);
        self.transition_to(StreamSessionState::Reconnecting);
        self.metrics.record_reconnect();

        if let Some(mut old) = self.session.lock().take() {
            old.close();
        }
        *self.link_stats.lock() = None;
        self.settle();

        match self.open_session() {
            Ok(session) => self.install(session),
            Err(e) => {
                error!("Reconnect failed: {}", e);
                self.finish_reconnect(StreamSessionState::Failed {
                    reason: e.to_string(),
                });
            }
        }

        self.reconnecting.store(false, Ordering::SeqCst);
    }

    /// Wait for the server to drop the old connection, waking early on stop.
    fn settle(&self) {
        let deadline = Instant::now() + self.config.reconnect.settle();
        let step = self.config.queues.poll_timeout();
        while self.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(step.min(deadline - now));
        }
    }

    fn install(&self, mut session: Box<dyn TransportSession>) {
        let discarded = self.clear_queues();
        self.gate.arm();

        {
            let mut slot = self.session.lock();
            if !self.running.load(Ordering::SeqCst) {
                drop(slot);
                session.close();
                debug!("Stopped during reconnect, new session closed");
                return;
            }
            *self.link_stats.lock() = session.stats();
            *slot = Some(session);
            self.generation.fetch_add(1, Ordering::SeqCst);
        }

        self.encoder.request_key_unit();
        if self.finish_reconnect(StreamSessionState::Streaming) {
            info!(discarded, "Reconnected");
        }
    }
}

impl EncodedSink for Shared {
    fn on_encoded_frame(&self, frame: EncodedFrame) {
        if !self.state.read().accepts_frames() {
            self.metrics.record_idle_frame();
            trace!(kind = frame.kind.as_str(), "Not streaming, frame discarded");
            return;
        }

        match frame.kind {
            MediaKind::Video => {
                if !self.gate.admits(frame.is_key_unit) {
                    self.metrics.record_gated_frame();
                    trace!(ts = frame.timestamp_us, "Delta frame held by resolution gate");
                    return;
                }

                let snapshot = frame.deep_copy();
                let is_key_unit = frame.is_key_unit;
                if self.video_queue.push(frame) {
                    *self.last_video.lock() = Some(snapshot);
                    if is_key_unit {
                        self.gate.clear();
                    }
                }
            }
            MediaKind::Audio => {
                self.audio_queue.push(frame);
            }
        }
    }

    fn on_codec_config(&self, config: CodecConfig) {
        *self.codec_config.lock() = Some(config.clone());
        if !self.state.read().is_streaming() {
            debug!("Codec config cached");
            return;
        }

        let result = match self.session.lock().as_mut() {
            Some(session) => session.send_codec_config(&config),
            None => Err(TransportError::NotConnected),
        };
        match result {
            Ok(()) => info!("Sent codec config"),
            Err(e) => {
                warn!("Failed to send codec config: {}", e);
                self.metrics.record_send_error();
            }
        }
    }
}

impl LinkMonitor for Shared {
    /// Never waits on an in-flight send: reads the session directly only if
    /// it is idle, else the snapshot taken after the last send.
    fn network_stats(&self) -> Option<NetworkStats> {
        if let Some(slot) = self.session.try_lock() {
            *self.link_stats.lock() = slot.as_ref().and_then(|s| s.stats());
        }
        *self.link_stats.lock()
    }

    fn dropped_frames(&self) -> u64 {
        self.video_queue.dropped()
    }

    fn send_errors(&self) -> u64 {
        self.metrics.send_errors()
    }

    fn arm_resolution_gate(&self) {
        self.gate.arm();
    }
}
