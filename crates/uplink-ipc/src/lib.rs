//! Typed host<->engine messages for the uplink streamer.
//!
//! This crate defines the message types exchanged between a host
//! application and the streaming engine: commands going in, status and
//! telemetry events coming out.

mod commands;
mod events;
mod state;
mod types;

pub use commands::HostCommand;
pub use events::StreamEvent;
pub use state::StreamStatus;
pub use types::{StreamConfig, StreamMetrics};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for commands (host → engine).
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Channel capacity for events (engine → host).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded command channel.
pub fn command_channel() -> (Sender<HostCommand>, Receiver<HostCommand>) {
    crossbeam_channel::bounded(COMMAND_CHANNEL_CAPACITY)
}

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<StreamEvent>, Receiver<StreamEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
