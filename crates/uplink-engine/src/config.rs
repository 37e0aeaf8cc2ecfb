//! Engine configuration.
//!
//! Every field has a default, so a JSON file only needs the values it
//! changes. Durations are stored in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queues: QueueConfig,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    pub adaptation: AdaptationConfig,
}

impl EngineConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queues.video_capacity == 0 || self.queues.audio_capacity == 0 {
            return Err(ConfigError::Invalid("queue capacities must be positive".into()));
        }
        if self.queues.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid("poll_timeout_ms must be positive".into()));
        }
        if self.heartbeat.interval_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat interval_ms must be positive".into()));
        }
        self.adaptation.validate()
    }
}

/// Send queue sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Video frames held before the overflow policy applies.
    pub video_capacity: usize,
    /// Audio frames held before the overflow policy applies.
    pub audio_capacity: usize,
    /// How long a sender waits on an empty queue before rechecking state.
    pub poll_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            video_capacity: 5,
            audio_capacity: 60,
            poll_timeout_ms: 100,
        }
    }
}

impl QueueConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Reconnection and shutdown timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Pause between closing a failed session and opening its replacement.
    pub settle_ms: u64,
    /// Upper bound on waiting for sender threads in `stop()`.
    pub join_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            settle_ms: 1500,
            join_timeout_ms: 2000,
        }
    }
}

impl ReconnectConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// Background heartbeat timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// One operating point: resolution plus its bitrate ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityLevel {
    pub width: u32,
    pub height: u32,
    /// Highest bitrate (bps) used at this level.
    pub bitrate_ceiling: u32,
}

impl QualityLevel {
    pub const fn new(width: u32, height: u32, bitrate_ceiling: u32) -> Self {
        Self {
            width,
            height,
            bitrate_ceiling,
        }
    }

    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Entry thresholds for one severity tier. A tier matches when any
/// configured signal reaches its threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityThresholds {
    /// Dropped frames per second.
    pub drop_rate: f64,
    /// Send errors since the previous sample.
    pub errors: u64,
    /// Transport delay in milliseconds; `None` ignores delay for this tier.
    pub delay_ms: Option<u32>,
    /// Packet loss percent; `None` ignores loss for this tier.
    pub loss_percent: Option<u32>,
}

/// Adaptation tuning. Defaults are the values the algorithm was tuned with
/// on mobile uplinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptationConfig {
    /// Quality levels, best first.
    pub levels: Vec<QualityLevel>,

    pub min_bitrate: u32,
    pub max_bitrate: u32,
    /// Hard ceiling at the lowest level, below its nominal ceiling.
    pub lowest_level_bitrate_cap: u32,

    pub severe: SeverityThresholds,
    pub bad: SeverityThresholds,
    pub degraded: SeverityThresholds,
    pub mild: SeverityThresholds,

    /// Degraded at the top level escalates straight to the lowest level
    /// when any of these is reached.
    pub degraded_escalation_drop_rate: f64,
    pub degraded_escalation_delay_ms: u32,
    pub degraded_escalation_errors: u64,

    /// Degraded below the top level stays put, cutting bitrate by
    /// `degraded_hold_bitrate_factor`, while all of these are below their
    /// limits.
    pub degraded_hold_max_drop_rate: f64,
    pub degraded_hold_max_delay_ms: u32,
    pub degraded_hold_max_errors: u64,
    pub degraded_hold_bitrate_factor: f64,

    /// Bitrate after a bad-tier drop that does not reach the lowest level.
    pub bad_level_bitrate: u32,
    /// Multipliers applied to the current bitrate.
    pub degraded_bitrate_factor: f64,
    pub degraded_lowest_level_factor: f64,
    pub mild_bitrate_factor: f64,

    pub level_down_cooldown_ms: u64,
    pub level_up_cooldown_ms: u64,
    pub bitrate_cooldown_ms: u64,

    /// Smallest relative change a bitrate-only decision may make.
    pub min_bitrate_change_ratio: f64,
    /// Relative step of the slow increase toward the base bitrate.
    pub bitrate_increase_ratio: f64,
    /// Bitrate added when stepping up to a level other than the top one.
    pub upgrade_bitrate_step: u32,
    /// Consecutive healthy samples required before stepping up.
    pub upgrade_confirmations: u32,

    pub healthy_max_delay_ms: u32,
    pub healthy_max_loss_percent: u32,
    pub healthy_max_drop_rate: f64,
    /// The slow increase tolerates slightly worse conditions than a step up.
    pub increase_max_delay_ms: u32,
    pub increase_max_drop_rate: f64,

    pub fast_interval_ms: u64,
    pub normal_interval_ms: u64,
    /// Errors per sample above which the fast interval is used.
    pub congestion_error_threshold: u64,
    /// Drops per sample above which the fast interval is used.
    pub congestion_drop_threshold: u64,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            levels: vec![
                QualityLevel::new(1920, 1080, 5_000_000),
                QualityLevel::new(1280, 720, 1_200_000),
                QualityLevel::new(854, 480, 500_000),
            ],
            min_bitrate: 350_000,
            max_bitrate: 5_000_000,
            lowest_level_bitrate_cap: 450_000,
            severe: SeverityThresholds {
                drop_rate: 18.0,
                errors: 8,
                delay_ms: Some(800),
                loss_percent: Some(15),
            },
            bad: SeverityThresholds {
                drop_rate: 12.0,
                errors: 5,
                delay_ms: Some(500),
                loss_percent: Some(8),
            },
            degraded: SeverityThresholds {
                drop_rate: 3.0,
                errors: 2,
                delay_ms: Some(300),
                loss_percent: Some(5),
            },
            mild: SeverityThresholds {
                drop_rate: 1.0,
                errors: 1,
                delay_ms: None,
                loss_percent: None,
            },
            degraded_escalation_drop_rate: 6.0,
            degraded_escalation_delay_ms: 400,
            degraded_escalation_errors: 3,
            degraded_hold_max_drop_rate: 10.0,
            degraded_hold_max_delay_ms: 500,
            degraded_hold_max_errors: 4,
            degraded_hold_bitrate_factor: 0.65,
            bad_level_bitrate: 500_000,
            degraded_bitrate_factor: 0.6,
            degraded_lowest_level_factor: 0.7,
            mild_bitrate_factor: 0.75,
            level_down_cooldown_ms: 10_000,
            level_up_cooldown_ms: 18_000,
            bitrate_cooldown_ms: 15_000,
            min_bitrate_change_ratio: 0.25,
            bitrate_increase_ratio: 0.10,
            upgrade_bitrate_step: 200_000,
            upgrade_confirmations: 2,
            healthy_max_delay_ms: 80,
            healthy_max_loss_percent: 1,
            healthy_max_drop_rate: 0.8,
            increase_max_delay_ms: 100,
            increase_max_drop_rate: 1.0,
            fast_interval_ms: 4000,
            normal_interval_ms: 6000,
            congestion_error_threshold: 2,
            congestion_drop_threshold: 10,
        }
    }
}

impl AdaptationConfig {
    pub fn level_down_cooldown(&self) -> Duration {
        Duration::from_millis(self.level_down_cooldown_ms)
    }

    pub fn level_up_cooldown(&self) -> Duration {
        Duration::from_millis(self.level_up_cooldown_ms)
    }

    pub fn bitrate_cooldown(&self) -> Duration {
        Duration::from_millis(self.bitrate_cooldown_ms)
    }

    pub fn fast_interval(&self) -> Duration {
        Duration::from_millis(self.fast_interval_ms)
    }

    pub fn normal_interval(&self) -> Duration {
        Duration::from_millis(self.normal_interval_ms)
    }

    /// Check the level table and numeric ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.levels.is_empty() {
            return Err(ConfigError::Invalid("at least one quality level is required".into()));
        }
        if self
            .levels
            .windows(2)
            .any(|pair| pair[0].pixels() <= pair[1].pixels())
        {
            return Err(ConfigError::Invalid(
                "quality levels must be ordered from highest to lowest resolution".into(),
            ));
        }
        if self.min_bitrate == 0 || self.min_bitrate > self.max_bitrate {
            return Err(ConfigError::Invalid(format!(
                "bitrate range {}..={} is empty",
                self.min_bitrate, self.max_bitrate
            )));
        }
        if let Some(level) = self
            .levels
            .iter()
            .find(|l| l.bitrate_ceiling < self.min_bitrate)
        {
            return Err(ConfigError::Invalid(format!(
                "{}x{} bitrate_ceiling is below min_bitrate",
                level.width, level.height
            )));
        }
        if self.lowest_level_bitrate_cap < self.min_bitrate {
            return Err(ConfigError::Invalid(
                "lowest_level_bitrate_cap is below min_bitrate".into(),
            ));
        }

        let ratios = [
            ("degraded_bitrate_factor", self.degraded_bitrate_factor),
            ("degraded_lowest_level_factor", self.degraded_lowest_level_factor),
            ("degraded_hold_bitrate_factor", self.degraded_hold_bitrate_factor),
            ("mild_bitrate_factor", self.mild_bitrate_factor),
            ("min_bitrate_change_ratio", self.min_bitrate_change_ratio),
            ("bitrate_increase_ratio", self.bitrate_increase_ratio),
        ];
        for (name, value) in ratios {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }

        if self.fast_interval_ms == 0 || self.normal_interval_ms == 0 {
            return Err(ConfigError::Invalid("sampling intervals must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.queues.video_capacity, 5);
        assert_eq!(config.queues.audio_capacity, 60);
        assert_eq!(config.heartbeat.interval(), Duration::from_secs(1));
        assert_eq!(config.adaptation.levels.len(), 3);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "queues": { "video_capacity": 8 }, "adaptation": { "min_bitrate": 300000 } }"#,
        )
        .unwrap();
        assert_eq!(config.queues.video_capacity, 8);
        assert_eq!(config.queues.audio_capacity, 60);
        assert_eq!(config.adaptation.min_bitrate, 300_000);
        assert_eq!(config.adaptation.max_bitrate, 5_000_000);
    }

    #[test]
    fn test_rejects_unordered_levels() {
        let json = r#"{ "adaptation": { "levels": [
            { "width": 854, "height": 480, "bitrate_ceiling": 500000 },
            { "width": 1280, "height": 720, "bitrate_ceiling": 1200000 }
        ] } }"#;
        assert!(matches!(
            EngineConfig::from_json_str(json),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_bad_ranges() {
        let mut config = EngineConfig::default();
        config.adaptation.min_bitrate = 6_000_000;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.adaptation.mild_bitrate_factor = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.adaptation.levels[1].bitrate_ceiling = 200_000;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.queues.video_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        assert!(matches!(
            EngineConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
