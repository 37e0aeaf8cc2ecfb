//! Adaptive bitrate control.
//!
//! [`decision`] classifies a link sample and picks a target, [`adapter`]
//! applies hysteresis to it, and [`controller`] runs the sampling timer and
//! pushes the outcome to the encoder.

pub mod adapter;
pub mod controller;
pub mod decision;
pub mod ladder;

pub use adapter::{AdaptationState, Adjustment, BitrateAdapter, LinkSample};
pub use controller::{BitrateController, LinkMonitor, ResolutionCallback};
pub use decision::{Conditions, Severity, Target};
pub use ladder::QualityLevelTable;
