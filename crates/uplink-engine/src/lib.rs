//! Streaming delivery and adaptive bitrate control.
//!
//! [`StreamController`] moves encoded frames from the encoder callback to a
//! transport session through bounded queues, reconnecting in place when a
//! send fails. [`BitrateController`] samples the link and picks the quality
//! level and bitrate. [`LiveStream`] ties the two together behind the host
//! command loop.

pub mod abr;
pub mod config;
mod controller;
mod error;
mod facade;
mod gate;
mod metrics;
mod queue;
mod state;

#[cfg(test)]
mod testing;

pub use abr::{AdaptationState, Adjustment, BitrateController, LinkMonitor, ResolutionCallback};
pub use config::{
    AdaptationConfig, ConfigError, EngineConfig, HeartbeatConfig, QualityLevel, QueueConfig,
    ReconnectConfig, SeverityThresholds,
};
pub use controller::StreamController;
pub use error::{EngineError, EngineResult};
pub use facade::{session_metadata, LiveStream};
pub use gate::ResolutionGate;
pub use metrics::MetricsCollector;
pub use queue::{BoundedFrameQueue, OverflowPolicy};
pub use state::StreamSessionState;
