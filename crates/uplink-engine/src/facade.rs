//! Host-facing entry point.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, instrument, warn};
use uplink_encoder::{CodecConfig, EncodedFrame, EncoderControl};
use uplink_ipc::{HostCommand, StreamConfig, StreamEvent, StreamMetrics};
use uplink_transport::{SessionMetadata, TransportConnector};

use crate::abr::{BitrateController, ResolutionCallback};
use crate::config::EngineConfig;
use crate::controller::StreamController;
use crate::error::EngineResult;
use crate::state::StreamSessionState;

/// How long the command loop waits before doing periodic work.
const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Metrics emission period while streaming.
const METRICS_INTERVAL: Duration = Duration::from_secs(1);

/// One live stream: delivery plus adaptation.
pub struct LiveStream {
    controller: StreamController,
    bitrate: BitrateController,
    events: Sender<StreamEvent>,
}

impl LiveStream {
    /// Open the transport for `stream.url` and wire the encoder to it.
    pub fn new(
        stream: &StreamConfig,
        config: EngineConfig,
        connector: Arc<dyn TransportConnector>,
        encoder: Arc<dyn EncoderControl>,
        events: Sender<StreamEvent>,
    ) -> EngineResult<Self> {
        let controller = StreamController::initialize(
            stream.url.clone(),
            connector,
            Arc::clone(&encoder),
            config.clone(),
            events.clone(),
        )?;
        controller.set_metadata(session_metadata(stream));

        let bitrate = BitrateController::new(
            config.adaptation,
            stream.video_bitrate,
            (stream.width, stream.height),
            encoder,
            controller.link_monitor(),
            events.clone(),
        )?;

        Ok(Self {
            controller,
            bitrate,
            events,
        })
    }

    /// Register the callback invoked when adaptation switches resolution.
    pub fn with_resolution_callback(self, callback: ResolutionCallback) -> Self {
        self.bitrate.set_resolution_callback(callback);
        self
    }

    pub fn start(&self) -> EngineResult<()> {
        self.controller.start()?;
        self.bitrate.start();
        Ok(())
    }

    /// Stop delivery and adaptation. Adaptation history is discarded.
    pub fn stop(&self) {
        self.bitrate.stop();
        self.controller.stop();
        self.bitrate.reset();
    }

    /// Manual bitrate override. Returns the clamped value applied.
    pub fn set_bitrate(&self, bitrate: u32) -> u32 {
        self.bitrate.set_bitrate(bitrate)
    }

    pub fn current_bitrate(&self) -> u32 {
        self.bitrate.current_bitrate()
    }

    pub fn is_streaming(&self) -> bool {
        self.controller.is_streaming()
    }

    pub fn state(&self) -> StreamSessionState {
        self.controller.state()
    }

    pub fn enter_background(&self) {
        self.controller.enter_background();
    }

    pub fn enter_foreground(&self) {
        self.controller.enter_foreground();
    }

    pub fn on_encoded_frame(&self, frame: EncodedFrame) {
        self.controller.on_encoded_frame(frame);
    }

    pub fn on_codec_config(&self, config: CodecConfig) {
        self.controller.on_codec_config(config);
    }

    /// The capture pipeline finished a resolution switch.
    pub fn on_resolution_changed(&self, width: u32, height: u32) {
        self.controller
            .on_resolution_changed(width, height, self.bitrate.current_bitrate());
    }

    /// Re-sync adaptation after a resolution change the host made itself.
    pub fn update_level_for_resolution(&self, width: u32, height: u32) -> Option<usize> {
        self.bitrate.update_level_for_resolution(width, height)
    }

    pub fn controller(&self) -> &StreamController {
        &self.controller
    }

    pub fn bitrate_controller(&self) -> &BitrateController {
        &self.bitrate
    }

    pub fn metrics(&self) -> StreamMetrics {
        StreamMetrics {
            bitrate: self.bitrate.current_bitrate(),
            level: self.bitrate.current_level(),
            ..self.controller.metrics()
        }
    }

    /// Process host commands until `Shutdown` or until the channel closes.
    #[instrument(name = "live_stream_run", skip_all)]
    pub fn run(&self, command_rx: Receiver<HostCommand>) {
        info!("Command loop starting");
        let mut last_metrics = Instant::now();

        loop {
            match command_rx.recv_timeout(COMMAND_POLL_INTERVAL) {
                Ok(command) => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("Command channel disconnected, shutting down");
                    self.stop();
                    break;
                }
            }

            if self.is_streaming() && last_metrics.elapsed() >= METRICS_INTERVAL {
                self.emit_metrics();
                last_metrics = Instant::now();
            }
        }

        info!("Command loop stopped");
    }

    /// Handle a command. Returns false if the loop should exit.
    fn handle_command(&self, command: HostCommand) -> bool {
        debug!(?command, "Handling command");

        match command {
            HostCommand::Start => {
                if let Err(e) = self.start() {
                    error!("Stream start failed: {}", e);
                }
            }
            HostCommand::Stop => self.stop(),
            HostCommand::SetBitrate(bitrate) => {
                self.set_bitrate(bitrate);
            }
            HostCommand::EnterBackground => self.enter_background(),
            HostCommand::EnterForeground => self.enter_foreground(),
            HostCommand::GetMetrics => self.emit_metrics(),
            HostCommand::Shutdown => {
                self.stop();
                self.send_event(StreamEvent::Shutdown);
                return false;
            }
        }

        true
    }

    fn emit_metrics(&self) {
        self.send_event(StreamEvent::Metrics(self.metrics()));
    }

    fn send_event(&self, event: StreamEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }
}

impl Drop for LiveStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Session metadata announced for a stream configuration.
pub fn session_metadata(stream: &StreamConfig) -> SessionMetadata {
    SessionMetadata {
        width: stream.width,
        height: stream.height,
        video_bitrate: stream.video_bitrate,
        fps: stream.fps,
        audio_sample_rate: stream.audio_sample_rate,
        audio_channels: stream.audio_channels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abr::Adjustment;
    use crate::testing::*;
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;
    use uplink_ipc::StreamStatus;
    use uplink_transport::NetworkStats;

    fn stream_config() -> StreamConfig {
        StreamConfig {
            url: "rtmp://localhost/live/key".into(),
            ..StreamConfig::default()
        }
    }

    fn live_stream() -> (
        LiveStream,
        Arc<FakeConnector>,
        Arc<FakeEncoder>,
        Receiver<StreamEvent>,
    ) {
        let connector = Arc::new(FakeConnector::default());
        let encoder = Arc::new(FakeEncoder::default());
        let (tx, rx) = uplink_ipc::event_channel();
        let live = LiveStream::new(
            &stream_config(),
            fast_config(),
            connector.clone(),
            encoder.clone(),
            tx,
        )
        .unwrap();
        (live, connector, encoder, rx)
    }

    #[test]
    fn test_metadata_announced_on_open() {
        let (_live, connector, _encoder, _rx) = live_stream();
        assert_eq!(
            connector.session(0).sent(),
            vec![Sent::Metadata(session_metadata(&stream_config()))]
        );
    }

    #[test]
    fn test_run_handles_commands_until_shutdown() {
        let (live, _connector, encoder, events) = live_stream();
        let (command_tx, command_rx) = uplink_ipc::command_channel();
        command_tx.send(HostCommand::Start).unwrap();
        command_tx.send(HostCommand::SetBitrate(1_000_000)).unwrap();
        command_tx.send(HostCommand::GetMetrics).unwrap();
        command_tx.send(HostCommand::Shutdown).unwrap();

        live.run(command_rx);

        let events: Vec<StreamEvent> = events.try_iter().collect();
        assert_eq!(events.first(), Some(&StreamEvent::Status(StreamStatus::Connecting)));
        assert_eq!(events.last(), Some(&StreamEvent::Shutdown));
        assert!(events.contains(&StreamEvent::Status(StreamStatus::Connected)));
        assert!(events.contains(&StreamEvent::Status(StreamStatus::Stopped)));
        assert!(events.contains(&StreamEvent::BitrateChanged { bitrate: 1_000_000 }));

        let metrics = events.iter().find_map(|e| match e {
            StreamEvent::Metrics(m) => Some(m.clone()),
            _ => None,
        });
        assert_eq!(metrics.map(|m| m.bitrate), Some(1_000_000));

        assert_eq!(encoder.bitrates(), vec![2_000_000, 1_000_000]);
        assert!(!live.is_streaming());
    }

    #[test]
    fn test_run_exits_when_host_disconnects() {
        let (live, _connector, _encoder, _events) = live_stream();
        let (command_tx, command_rx) = uplink_ipc::command_channel();
        command_tx.send(HostCommand::Start).unwrap();
        drop(command_tx);

        live.run(command_rx);
        assert_eq!(live.state(), StreamSessionState::Stopped);
    }

    #[test]
    fn test_congestion_switches_to_lowest_level_end_to_end() {
        let (live, connector, encoder, _events) = live_stream();
        let resized = Arc::new(Mutex::new(Vec::new()));
        let resized_cb = resized.clone();
        let live = live.with_resolution_callback(Arc::new(move |w, h| {
            resized_cb.lock().push((w, h));
        }));

        live.start().unwrap();
        assert_eq!(live.current_bitrate(), 2_000_000);

        *connector.session(0).stats.lock() = NetworkStats {
            delay_ms: 600,
            packet_loss_percent: 10,
            dropped_frames: 15,
            ..NetworkStats::default()
        };

        let adjustment = live.bitrate_controller().tick();
        assert_eq!(
            adjustment,
            Adjustment::Level {
                level: 2,
                width: 854,
                height: 480,
                bitrate: 350_000
            }
        );
        assert_eq!(*resized.lock(), vec![(854, 480)]);
        assert!(live.controller().is_gate_armed());
        assert_eq!(encoder.bitrates().last(), Some(&350_000));

        live.on_encoded_frame(video(10, false));
        live.on_encoded_frame(video(20, true));
        assert!(!live.controller().is_gate_armed());

        let log = connector.session(0);
        assert!(wait_until(Duration::from_secs(3), || log.video_timestamps() == vec![20]));
        assert_eq!(live.metrics().level, 2);
        assert_eq!(live.metrics().gated_frames, 1);
        assert!(encoder.key_requests.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_stop_resets_adaptation() {
        let (live, _connector, _encoder, _events) = live_stream();
        live.start().unwrap();
        assert_eq!(live.set_bitrate(900_000), 900_000);

        live.stop();
        assert_eq!(live.current_bitrate(), 2_000_000);
        assert!(!live.bitrate_controller().is_running());
    }

    #[test]
    fn test_initial_level_follows_stream_resolution() {
        let connector = Arc::new(FakeConnector::default());
        let encoder = Arc::new(FakeEncoder::default());
        let (tx, _rx) = uplink_ipc::event_channel();
        let stream = StreamConfig {
            width: 1280,
            height: 720,
            video_bitrate: 1_000_000,
            ..stream_config()
        };
        let live = LiveStream::new(&stream, fast_config(), connector, encoder, tx).unwrap();

        assert_eq!(live.bitrate_controller().current_level(), 1);
        assert_eq!(live.current_bitrate(), 1_000_000);
        assert_eq!(live.metrics().level, 1);
    }

    #[test]
    fn test_update_level_for_resolution() {
        let (live, _connector, _encoder, _events) = live_stream();
        assert_eq!(live.update_level_for_resolution(1280, 720), Some(1));
        assert_eq!(live.update_level_for_resolution(640, 360), None);
        assert_eq!(live.metrics().level, 1);
    }
}
