//! `uplink` command-line host.
//!
//! Replays an H.264 Annex B file through the live streaming engine to an
//! RTMP server. Control commands are read from stdin, engine events are
//! logged.

mod commands;

pub use commands::parse_command;

use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use uplink_encoder::{AnnexBReplayEncoder, ReplayConfig};
use uplink_engine::{EngineConfig, LiveStream};
use uplink_ipc::{command_channel, event_channel, HostCommand, StreamConfig, StreamEvent, StreamStatus};
use uplink_transport::RtmpConnector;

/// Contents of the JSON config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub stream: StreamConfig,
    pub engine: EngineConfig,
    pub replay: ReplayConfig,
}

impl CliConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse config")?;
        config.engine.validate()?;
        if config.stream.url.is_empty() {
            bail!("stream.url is required");
        }
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json_str(&json)
    }
}

/// Initialize logging.
fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "uplink=info,uplink_cli=info,uplink_engine=debug,uplink_encoder=info,uplink_transport=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Run the binary: `uplink <config.json> <file.h264>`.
pub fn run() -> Result<()> {
    init_logging();

    let mut args = std::env::args_os().skip(1);
    let (Some(config_path), Some(stream_path)) = (args.next(), args.next()) else {
        bail!("usage: uplink <config.json> <file.h264>");
    };

    let config = CliConfig::from_path(Path::new(&config_path))?;
    let encoder = Arc::new(
        AnnexBReplayEncoder::from_path(&stream_path, config.replay.clone())
            .context("Failed to load stream file")?,
    );
    info!(units = encoder.len(), "Loaded stream file");

    let (command_tx, command_rx) = command_channel();
    let (event_tx, event_rx) = event_channel();

    let live = LiveStream::new(
        &config.stream,
        config.engine.clone(),
        Arc::new(RtmpConnector::default()),
        encoder.clone(),
        event_tx,
    )?
    .with_resolution_callback(Arc::new(|width, height| {
        info!(width, height, "Resolution change requested, replay keeps its source size");
    }));

    let engine = thread::spawn(move || live.run(command_rx));
    let printer = thread::spawn(move || {
        for event in event_rx {
            log_event(&event);
        }
    });

    command_tx.send(HostCommand::Start)?;
    encoder.start()?;
    info!("Commands: start, stop, bg, fg, bitrate <bps>, stats, quit");

    let mut shutdown_sent = false;
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        match parse_command(&line) {
            Ok(Some(command)) => {
                let shutdown = command == HostCommand::Shutdown;
                if command_tx.send(command).is_err() {
                    warn!("Engine stopped, exiting");
                    break;
                }
                if shutdown {
                    shutdown_sent = true;
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => warn!("{:#}", e),
        }
    }

    if !shutdown_sent {
        let _ = command_tx.send(HostCommand::Shutdown);
    }
    if engine.join().is_err() {
        error!("Engine thread panicked");
    }
    encoder.stop();
    drop(command_tx);
    let _ = printer.join();

    info!("Exiting");
    Ok(())
}

fn log_event(event: &StreamEvent) {
    match event {
        StreamEvent::Status(StreamStatus::Failed { reason }) => {
            error!(reason = %reason, "Stream failed");
        }
        StreamEvent::Status(status) => info!(status = status.name(), "Stream status"),
        StreamEvent::Metrics(metrics) => match serde_json::to_string(metrics) {
            Ok(json) => info!("Metrics: {}", json),
            Err(e) => warn!("Failed to serialize metrics: {}", e),
        },
        StreamEvent::ResolutionChanged { width, height } => {
            info!(width, height, "Resolution changed");
        }
        StreamEvent::BitrateChanged { bitrate } => info!(bitrate, "Bitrate changed"),
        StreamEvent::Shutdown => info!("Engine shut down"),
    }
}
