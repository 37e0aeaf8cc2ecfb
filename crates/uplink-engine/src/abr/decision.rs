//! Congestion classification and one-step target selection.
//!
//! A sample is classified into a severity tier, and the tier maps directly
//! to the level and bitrate to move to. Cooldowns and minimum change sizes
//! are applied later by the adapter.

use crate::abr::ladder::QualityLevelTable;
use crate::config::{AdaptationConfig, SeverityThresholds};

/// Link conditions over one sampling interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conditions {
    /// Dropped frames per second.
    pub drop_rate: f64,
    /// Send errors since the previous sample.
    pub errors: u64,
    pub delay_ms: u32,
    pub loss_percent: u32,
}

/// Severity tiers, mildest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Healthy,
    Mild,
    Degraded,
    Bad,
    Severe,
}

impl Severity {
    /// Classify by the first tier, worst first, that any signal reaches.
    pub fn classify(conditions: &Conditions, config: &AdaptationConfig) -> Self {
        if reaches(conditions, &config.severe) {
            Severity::Severe
        } else if reaches(conditions, &config.bad) {
            Severity::Bad
        } else if reaches(conditions, &config.degraded) {
            Severity::Degraded
        } else if reaches(conditions, &config.mild) {
            Severity::Mild
        } else {
            Severity::Healthy
        }
    }
}

fn reaches(c: &Conditions, t: &SeverityThresholds) -> bool {
    c.drop_rate >= t.drop_rate
        || c.errors >= t.errors
        || t.delay_ms.is_some_and(|d| c.delay_ms >= d)
        || t.loss_percent.is_some_and(|l| c.loss_percent >= l)
}

/// Where a decision wants to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub level: usize,
    pub bitrate: u32,
}

/// Map a congested sample straight to its target.
///
/// Returns `None` for healthy samples; recovery is handled separately.
pub fn plan(
    severity: Severity,
    conditions: &Conditions,
    current_level: usize,
    current_bitrate: u32,
    table: &QualityLevelTable,
    config: &AdaptationConfig,
) -> Option<Target> {
    let lowest = table.lowest();
    let scaled = |factor: f64| (f64::from(current_bitrate) * factor) as u32;

    let (level, bitrate) = match severity {
        Severity::Healthy => return None,
        Severity::Severe => (lowest, config.min_bitrate),
        Severity::Bad => {
            let level = (current_level + 2).min(lowest);
            let bitrate = if level == lowest {
                config.min_bitrate
            } else {
                config.bad_level_bitrate.max(config.min_bitrate)
            };
            (level, bitrate)
        }
        Severity::Degraded if current_level > 0 && current_level < lowest && holds(conditions, config) => {
            (current_level, scaled(config.degraded_hold_bitrate_factor))
        }
        Severity::Degraded if current_level == 0 && escalates(conditions, config) => {
            (lowest, config.min_bitrate)
        }
        Severity::Degraded if current_level < lowest => {
            let level = current_level + 1;
            let bitrate = if level == lowest {
                config.min_bitrate
            } else {
                scaled(config.degraded_bitrate_factor)
            };
            (level, bitrate)
        }
        Severity::Degraded => (current_level, scaled(config.degraded_lowest_level_factor)),
        Severity::Mild => (current_level, scaled(config.mild_bitrate_factor)),
    };

    Some(Target {
        level,
        bitrate: clamp_bitrate(bitrate, level, table, config),
    })
}

/// Degraded links at the top level that are already this bad skip the
/// intermediate levels.
fn escalates(c: &Conditions, config: &AdaptationConfig) -> bool {
    c.drop_rate >= config.degraded_escalation_drop_rate
        || c.delay_ms >= config.degraded_escalation_delay_ms
        || c.errors >= config.degraded_escalation_errors
}

/// Borderline degradation below the top level keeps the resolution and only
/// cuts bitrate; the lowest level is the costliest step to take.
fn holds(c: &Conditions, config: &AdaptationConfig) -> bool {
    c.drop_rate < config.degraded_hold_max_drop_rate
        && c.delay_ms < config.degraded_hold_max_delay_ms
        && c.errors < config.degraded_hold_max_errors
}

/// Clamp to `[min, max]` and the level's ceiling, and to the lowest-level
/// cap at the lowest level.
pub fn clamp_bitrate(
    bitrate: u32,
    level: usize,
    table: &QualityLevelTable,
    config: &AdaptationConfig,
) -> u32 {
    let clamped = bitrate
        .clamp(config.min_bitrate, config.max_bitrate)
        .min(table.level(level).bitrate_ceiling);
    if table.is_lowest(level) {
        clamped.min(config.lowest_level_bitrate_cap)
    } else {
        clamped
    }
}
