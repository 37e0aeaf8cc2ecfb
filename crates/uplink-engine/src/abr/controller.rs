//! Timer-driven adaptation thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};
use uplink_encoder::EncoderControl;
use uplink_ipc::StreamEvent;
use uplink_transport::NetworkStats;

use crate::abr::adapter::{AdaptationState, Adjustment, BitrateAdapter, LinkSample};
use crate::config::{AdaptationConfig, ConfigError};
use crate::error::EngineResult;

/// What the adaptation thread reads from, and arms on, the delivery side.
pub trait LinkMonitor: Send + Sync {
    /// Current transport statistics, or `None` to skip this sample.
    fn network_stats(&self) -> Option<NetworkStats>;

    /// Cumulative video frames dropped before reaching the transport.
    fn dropped_frames(&self) -> u64;

    /// Cumulative failed sends.
    fn send_errors(&self) -> u64;

    /// Discard delta frames until the next key unit.
    fn arm_resolution_gate(&self);
}

/// Invoked with the new `(width, height)` when the quality level changes.
pub type ResolutionCallback = Arc<dyn Fn(u32, u32) + Send + Sync>;

struct Shared {
    adapter: Mutex<BitrateAdapter>,
    encoder: Arc<dyn EncoderControl>,
    monitor: Arc<dyn LinkMonitor>,
    events: Sender<StreamEvent>,
    on_resolution: RwLock<Option<ResolutionCallback>>,
}

struct Sampler {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Samples the link on an adaptive interval and applies the adapter's
/// decisions to the encoder and the delivery side.
pub struct BitrateController {
    shared: Arc<Shared>,
    sampler: Mutex<Option<Sampler>>,
}

impl BitrateController {
    /// `width`x`height` is the resolution the encoder starts at; it selects
    /// the initial quality level.
    pub fn new(
        config: AdaptationConfig,
        initial_bitrate: u32,
        (width, height): (u32, u32),
        encoder: Arc<dyn EncoderControl>,
        monitor: Arc<dyn LinkMonitor>,
        events: Sender<StreamEvent>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let adapter = BitrateAdapter::new(config, initial_bitrate, width, height)
            .ok_or_else(|| ConfigError::Invalid("no quality levels".into()))?;
        debug!(
            level = adapter.current_level(),
            bitrate = adapter.current_bitrate(),
            "Adaptation initialized"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                adapter: Mutex::new(adapter),
                encoder,
                monitor,
                events,
                on_resolution: RwLock::new(None),
            }),
            sampler: Mutex::new(None),
        })
    }

    /// Register the resolution-change callback, replacing any previous one.
    pub fn set_resolution_callback(&self, callback: ResolutionCallback) {
        *self.shared.on_resolution.write() = Some(callback);
    }

    /// Start sampling. Counters accumulated so far are taken as the baseline.
    #[instrument(name = "abr_start", skip(self))]
    pub fn start(&self) {
        let mut sampler = self.sampler.lock();
        if sampler.is_some() {
            debug!("Adaptation already running, ignoring start");
            return;
        }

        let bitrate = {
            let mut adapter = self.shared.adapter.lock();
            adapter.rebase(&self.shared.sample_or_default(), Instant::now());
            adapter.current_bitrate()
        };
        self.shared.encoder.update_bitrate(bitrate);

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || {
            debug!("Adaptation loop starting");
            loop {
                let interval = shared.adapter.lock().next_interval();
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }

                let tick = panic::catch_unwind(AssertUnwindSafe(|| shared.tick(Instant::now())));
                if tick.is_err() {
                    error!("Adaptation tick panicked, continuing");
                }
            }
            debug!("Adaptation loop stopped");
        });

        *sampler = Some(Sampler { stop_tx, handle });
        info!(bitrate, "Adaptation started");
    }

    /// Stop sampling. State is kept; see [`reset`](Self::reset).
    #[instrument(name = "abr_stop", skip(self))]
    pub fn stop(&self) {
        let Some(sampler) = self.sampler.lock().take() else {
            return;
        };
        let _ = sampler.stop_tx.try_send(());
        if sampler.handle.join().is_err() {
            error!("Adaptation thread panicked");
        }
        info!("Adaptation stopped");
    }

    pub fn is_running(&self) -> bool {
        self.sampler.lock().is_some()
    }

    /// Run one sample immediately, outside the timer.
    pub fn tick(&self) -> Adjustment {
        self.shared.tick(Instant::now())
    }

    /// Manual override. Returns the clamped bitrate that was applied.
    pub fn set_bitrate(&self, bitrate: u32) -> u32 {
        let applied = self.shared.adapter.lock().set_bitrate(bitrate, Instant::now());
        info!(requested = bitrate, applied, "Bitrate set manually");
        self.shared.encoder.update_bitrate(applied);
        self.shared.send_event(StreamEvent::BitrateChanged { bitrate: applied });
        applied
    }

    pub fn current_bitrate(&self) -> u32 {
        self.shared.adapter.lock().current_bitrate()
    }

    pub fn current_level(&self) -> usize {
        self.shared.adapter.lock().current_level()
    }

    pub fn state(&self) -> AdaptationState {
        self.shared.adapter.lock().state().clone()
    }

    /// Re-sync the level after a resolution change made outside the adapter.
    pub fn update_level_for_resolution(&self, width: u32, height: u32) -> Option<usize> {
        let level = self
            .shared
            .adapter
            .lock()
            .update_level_for_resolution(width, height);
        match level {
            Some(level) => debug!(width, height, level, "Level re-synced to resolution"),
            None => warn!(width, height, "Resolution matches no quality level"),
        }
        level
    }

    /// Forget all adaptation history.
    pub fn reset(&self) {
        self.shared.adapter.lock().reset();
    }
}

impl Drop for BitrateController {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn sample(&self) -> Option<LinkSample> {
        Some(LinkSample {
            stats: self.monitor.network_stats()?,
            queue_dropped: self.monitor.dropped_frames(),
            send_errors: self.monitor.send_errors(),
        })
    }

    fn sample_or_default(&self) -> LinkSample {
        self.sample().unwrap_or_else(|| LinkSample {
            stats: NetworkStats::default(),
            queue_dropped: self.monitor.dropped_frames(),
            send_errors: self.monitor.send_errors(),
        })
    }

    fn tick(&self, now: Instant) -> Adjustment {
        let Some(sample) = self.sample() else {
            debug!("Network stats unavailable, skipping sample");
            return Adjustment::Hold;
        };

        let adjustment = self.adapter.lock().evaluate(&sample, now);
        self.apply(adjustment);
        adjustment
    }

    fn apply(&self, adjustment: Adjustment) {
        match adjustment {
            Adjustment::Hold => {}
            Adjustment::Bitrate { bitrate } => {
                info!(bitrate, "Adjusting bitrate");
                self.encoder.update_bitrate(bitrate);
                self.send_event(StreamEvent::BitrateChanged { bitrate });
            }
            Adjustment::Level {
                level,
                width,
                height,
                bitrate,
            } => {
                info!(level, width, height, bitrate, "Switching quality level");
                self.monitor.arm_resolution_gate();

                let callback = self.on_resolution.read().clone();
                if let Some(callback) = callback {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(width, height)));
                    if outcome.is_err() {
                        error!(width, height, "Resolution callback panicked");
                    }
                }

                self.encoder.update_bitrate(bitrate);
                self.encoder.request_key_unit();
                self.send_event(StreamEvent::ResolutionChanged { width, height });
                self.send_event(StreamEvent::BitrateChanged { bitrate });
            }
        }
    }

    fn send_event(&self, event: StreamEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
    use std::sync::Weak;
    use uplink_encoder::EncodedSink;

    #[derive(Default)]
    struct StubEncoder {
        key_requests: AtomicU64,
        bitrate: AtomicU32,
    }

    impl EncoderControl for StubEncoder {
        fn set_sink(&self, _sink: Weak<dyn EncodedSink>) {}

        fn request_key_unit(&self) {
            self.key_requests.fetch_add(1, Ordering::SeqCst);
        }

        fn update_bitrate(&self, bitrate: u32) {
            self.bitrate.store(bitrate, Ordering::SeqCst);
        }

        fn name(&self) -> &'static str {
            "stub"
        }
    }

    #[derive(Default)]
    struct StubMonitor {
        stats: Mutex<Option<NetworkStats>>,
        dropped: AtomicU64,
        armed: AtomicBool,
    }

    impl LinkMonitor for StubMonitor {
        fn network_stats(&self) -> Option<NetworkStats> {
            *self.stats.lock()
        }

        fn dropped_frames(&self) -> u64 {
            self.dropped.load(Ordering::SeqCst)
        }

        fn send_errors(&self) -> u64 {
            0
        }

        fn arm_resolution_gate(&self) {
            self.armed.store(true, Ordering::SeqCst);
        }
    }

    fn controller() -> (
        BitrateController,
        Arc<StubEncoder>,
        Arc<StubMonitor>,
        crossbeam_channel::Receiver<StreamEvent>,
    ) {
        let encoder = Arc::new(StubEncoder::default());
        let monitor = Arc::new(StubMonitor::default());
        let (tx, rx) = uplink_ipc::event_channel();
        let controller = BitrateController::new(
            AdaptationConfig::default(),
            2_000_000,
            (1920, 1080),
            encoder.clone(),
            monitor.clone(),
            tx,
        )
        .unwrap();
        (controller, encoder, monitor, rx)
    }

    #[test]
    fn test_missing_stats_skip_tick() {
        let (controller, encoder, _monitor, rx) = controller();
        assert_eq!(controller.tick(), Adjustment::Hold);
        assert_eq!(encoder.bitrate.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_level_change_side_effects() {
        let (controller, encoder, monitor, rx) = controller();
        let seen = Arc::new(Mutex::new(None));
        let seen_cb = seen.clone();
        controller.set_resolution_callback(Arc::new(move |w, h| {
            *seen_cb.lock() = Some((w, h));
        }));

        *monitor.stats.lock() = Some(NetworkStats {
            delay_ms: 900,
            ..NetworkStats::default()
        });
        let adjustment = controller.tick();

        assert!(matches!(adjustment, Adjustment::Level { level: 2, .. }));
        assert_eq!(*seen.lock(), Some((854, 480)));
        assert!(monitor.armed.load(Ordering::SeqCst));
        assert_eq!(encoder.bitrate.load(Ordering::SeqCst), 350_000);
        assert_eq!(encoder.key_requests.load(Ordering::SeqCst), 1);

        let events: Vec<StreamEvent> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                StreamEvent::ResolutionChanged {
                    width: 854,
                    height: 480
                },
                StreamEvent::BitrateChanged { bitrate: 350_000 },
            ]
        );
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let (controller, encoder, monitor, _rx) = controller();
        controller.set_resolution_callback(Arc::new(|_, _| panic!("pipeline exploded")));
        *monitor.stats.lock() = Some(NetworkStats {
            delay_ms: 900,
            ..NetworkStats::default()
        });

        controller.tick();
        assert_eq!(controller.current_level(), 2);
        assert_eq!(encoder.key_requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_manual_bitrate_reaches_encoder() {
        let (controller, encoder, _monitor, rx) = controller();
        assert_eq!(controller.set_bitrate(8_000_000), 5_000_000);
        assert_eq!(encoder.bitrate.load(Ordering::SeqCst), 5_000_000);
        assert_eq!(controller.current_bitrate(), 5_000_000);
        assert_eq!(
            rx.try_recv().unwrap(),
            StreamEvent::BitrateChanged { bitrate: 5_000_000 }
        );
    }

    #[test]
    fn test_start_stop_idempotent() {
        let (controller, encoder, _monitor, _rx) = controller();
        controller.start();
        controller.start();
        assert!(controller.is_running());
        assert_eq!(encoder.bitrate.load(Ordering::SeqCst), 2_000_000);

        controller.stop();
        controller.stop();
        assert!(!controller.is_running());
    }

    #[test]
    fn test_start_rebases_drop_counter() {
        let (controller, _encoder, monitor, _rx) = controller();
        monitor.dropped.store(500, Ordering::SeqCst);
        *monitor.stats.lock() = Some(NetworkStats::default());

        controller.start();
        controller.stop();

        assert_eq!(controller.tick(), Adjustment::Hold);
        assert_eq!(controller.state().last_dropped_sample, 500);
    }
}
