//! Adaptation state machine.
//!
//! [`BitrateAdapter`] owns the [`AdaptationState`] and turns one link sample
//! into at most one [`Adjustment`]. It never reads the clock itself; callers
//! pass `now`, which keeps the hysteresis deterministic under test.

use std::time::{Duration, Instant};

use tracing::debug;
use uplink_transport::NetworkStats;

use crate::abr::decision::{self, clamp_bitrate, Conditions, Severity};
use crate::abr::ladder::QualityLevelTable;
use crate::config::AdaptationConfig;

/// Cumulative counters read at one sampling instant.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkSample {
    pub stats: NetworkStats,
    /// Frames dropped by the video queue since the session began.
    pub queue_dropped: u64,
    /// Failed sends since the session began.
    pub send_errors: u64,
}

impl LinkSample {
    fn total_dropped(&self) -> u64 {
        self.queue_dropped + self.stats.dropped_frames
    }
}

/// Current operating point and hysteresis bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptationState {
    pub current_level: usize,
    pub current_bitrate: u32,
    /// User-requested bitrate; automatic increases never exceed it.
    pub base_bitrate: u32,
    pub last_level_change_at: Option<Instant>,
    pub last_bitrate_change_at: Option<Instant>,
    pub last_dropped_sample: u64,
    pub last_error_sample: u64,
    pub last_sample_at: Option<Instant>,
    /// Consecutive samples good enough to step up.
    pub healthy_streak: u32,
}

impl AdaptationState {
    fn initial(level: usize, bitrate: u32, base_bitrate: u32) -> Self {
        Self {
            current_level: level,
            current_bitrate: bitrate,
            base_bitrate,
            last_level_change_at: None,
            last_bitrate_change_at: None,
            last_dropped_sample: 0,
            last_error_sample: 0,
            last_sample_at: None,
            healthy_streak: 0,
        }
    }
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Hold,
    /// New encoder bitrate at the current level.
    Bitrate { bitrate: u32 },
    /// New level, carrying its bitrate.
    Level {
        level: usize,
        width: u32,
        height: u32,
        bitrate: u32,
    },
}

/// Adaptive bitrate decision engine.
#[derive(Debug)]
pub struct BitrateAdapter {
    config: AdaptationConfig,
    table: QualityLevelTable,
    initial: AdaptationState,
    state: AdaptationState,
    interval: Duration,
}

impl BitrateAdapter {
    /// Start at the level matching `width`x`height`, or at the top level if
    /// the resolution is not in the table.
    ///
    /// Returns `None` if the config has no quality levels.
    pub fn new(
        config: AdaptationConfig,
        initial_bitrate: u32,
        width: u32,
        height: u32,
    ) -> Option<Self> {
        let table = QualityLevelTable::new(config.levels.clone())?;
        let level = table.index_for_resolution(width, height).unwrap_or_else(|| {
            debug!(width, height, "Initial resolution not in the ladder, starting at the top");
            0
        });
        let base = initial_bitrate.clamp(config.min_bitrate, config.max_bitrate);
        let initial = AdaptationState::initial(
            level,
            clamp_bitrate(initial_bitrate, level, &table, &config),
            base,
        );
        let interval = config.normal_interval();
        Some(Self {
            config,
            table,
            state: initial.clone(),
            initial,
            interval,
        })
    }

    pub fn state(&self) -> &AdaptationState {
        &self.state
    }

    pub fn table(&self) -> &QualityLevelTable {
        &self.table
    }

    pub fn current_bitrate(&self) -> u32 {
        self.state.current_bitrate
    }

    pub fn current_level(&self) -> usize {
        self.state.current_level
    }

    /// Delay before the next sample.
    pub fn next_interval(&self) -> Duration {
        self.interval
    }

    /// Back to the initial operating point with no history.
    pub fn reset(&mut self) {
        self.state = self.initial.clone();
        self.interval = self.config.normal_interval();
    }

    /// Take `sample` as the baseline for the next delta without deciding.
    pub fn rebase(&mut self, sample: &LinkSample, now: Instant) {
        self.state.last_dropped_sample = sample.total_dropped();
        self.state.last_error_sample = sample.send_errors;
        self.state.last_sample_at = Some(now);
    }

    /// Manual override. Clamped like automatic changes and remembered as the
    /// base bitrate. Returns the applied value.
    pub fn set_bitrate(&mut self, bitrate: u32, now: Instant) -> u32 {
        let applied = clamp_bitrate(bitrate, self.state.current_level, &self.table, &self.config);
        self.state.base_bitrate = bitrate.clamp(self.config.min_bitrate, self.config.max_bitrate);
        self.state.current_bitrate = applied;
        self.state.last_bitrate_change_at = Some(now);
        applied
    }

    /// Re-sync the current level after an externally driven resolution
    /// change. Returns the new level if the resolution is in the table.
    pub fn update_level_for_resolution(&mut self, width: u32, height: u32) -> Option<usize> {
        let level = self.table.index_for_resolution(width, height)?;
        self.state.current_level = level;
        self.state.current_bitrate =
            clamp_bitrate(self.state.current_bitrate, level, &self.table, &self.config);
        Some(level)
    }

    /// Evaluate one sample.
    pub fn evaluate(&mut self, sample: &LinkSample, now: Instant) -> Adjustment {
        let total_dropped = sample.total_dropped();
        let dropped = total_dropped.saturating_sub(self.state.last_dropped_sample);
        let errors = sample.send_errors.saturating_sub(self.state.last_error_sample);
        let elapsed = self
            .state
            .last_sample_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(self.interval);

        self.state.last_dropped_sample = total_dropped;
        self.state.last_error_sample = sample.send_errors;
        self.state.last_sample_at = Some(now);

        self.interval = if errors > self.config.congestion_error_threshold
            || dropped > self.config.congestion_drop_threshold
        {
            self.config.fast_interval()
        } else {
            self.config.normal_interval()
        };

        let conditions = Conditions {
            drop_rate: dropped as f64 / elapsed.as_secs_f64().max(1.0),
            errors,
            delay_ms: sample.stats.delay_ms,
            loss_percent: sample.stats.packet_loss_percent,
        };
        let severity = Severity::classify(&conditions, &self.config);

        debug!(
            ?severity,
            drop_rate = conditions.drop_rate,
            errors,
            delay_ms = conditions.delay_ms,
            loss = conditions.loss_percent,
            level = self.state.current_level,
            bitrate = self.state.current_bitrate,
            "Adaptation sample"
        );

        if severity == Severity::Healthy {
            return self.recover(&conditions, now);
        }
        self.state.healthy_streak = 0;

        let Some(target) = decision::plan(
            severity,
            &conditions,
            self.state.current_level,
            self.state.current_bitrate,
            &self.table,
            &self.config,
        ) else {
            return Adjustment::Hold;
        };

        if target.level == self.state.current_level {
            return self.try_bitrate(target.bitrate, now);
        }

        let cooldown = if target.level > self.state.current_level {
            self.config.level_down_cooldown()
        } else {
            self.config.level_up_cooldown()
        };
        if cooled_down(self.state.last_level_change_at, now, cooldown) {
            return self.apply_level(target.level, target.bitrate, now);
        }

        debug!(target = target.level, "Level change held by cooldown");
        let bitrate = clamp_bitrate(
            target.bitrate,
            self.state.current_level,
            &self.table,
            &self.config,
        );
        self.try_bitrate(bitrate, now)
    }

    fn recover(&mut self, c: &Conditions, now: Instant) -> Adjustment {
        let cfg = &self.config;
        let upgradeable = c.delay_ms < cfg.healthy_max_delay_ms
            && c.loss_percent < cfg.healthy_max_loss_percent
            && c.errors == 0
            && c.drop_rate < cfg.healthy_max_drop_rate;

        if upgradeable {
            self.state.healthy_streak += 1;
        } else {
            self.state.healthy_streak = 0;
        }

        if upgradeable
            && self.state.current_level > 0
            && self.state.healthy_streak >= cfg.upgrade_confirmations
            && cooled_down(self.state.last_level_change_at, now, cfg.level_up_cooldown())
        {
            let level = self.state.current_level - 1;
            let bitrate = if level == 0 {
                self.state.base_bitrate
            } else {
                (self.state.current_bitrate + cfg.upgrade_bitrate_step)
                    .min(self.state.base_bitrate)
                    .min(self.table.level(level).bitrate_ceiling)
            };
            let bitrate = clamp_bitrate(bitrate, level, &self.table, cfg);
            return self.apply_level(level, bitrate, now);
        }

        let can_increase = self.state.current_level == 0
            && self.state.current_bitrate < self.state.base_bitrate
            && c.delay_ms < cfg.increase_max_delay_ms
            && c.loss_percent < cfg.healthy_max_loss_percent
            && c.errors == 0
            && c.drop_rate < cfg.increase_max_drop_rate
            && cooled_down(self.state.last_bitrate_change_at, now, cfg.bitrate_cooldown());

        if can_increase {
            let raised = (f64::from(self.state.current_bitrate) * (1.0 + cfg.bitrate_increase_ratio))
                as u32;
            let bitrate = clamp_bitrate(raised.min(self.state.base_bitrate), 0, &self.table, cfg);
            if bitrate > self.state.current_bitrate {
                self.state.current_bitrate = bitrate;
                self.state.last_bitrate_change_at = Some(now);
                return Adjustment::Bitrate { bitrate };
            }
        }

        Adjustment::Hold
    }

    /// Bitrate-only change, gated by cooldown and minimum relative size.
    fn try_bitrate(&mut self, bitrate: u32, now: Instant) -> Adjustment {
        let current = self.state.current_bitrate;
        if bitrate == current {
            return Adjustment::Hold;
        }
        if !cooled_down(
            self.state.last_bitrate_change_at,
            now,
            self.config.bitrate_cooldown(),
        ) {
            return Adjustment::Hold;
        }

        let ratio = f64::from(bitrate.abs_diff(current)) / f64::from(current.max(1));
        if ratio + f64::EPSILON < self.config.min_bitrate_change_ratio {
            debug!(current, bitrate, ratio, "Bitrate change below minimum step");
            return Adjustment::Hold;
        }

        self.state.current_bitrate = bitrate;
        self.state.last_bitrate_change_at = Some(now);
        Adjustment::Bitrate { bitrate }
    }

    fn apply_level(&mut self, level: usize, bitrate: u32, now: Instant) -> Adjustment {
        let quality = *self.table.level(level);
        self.state.current_level = level;
        self.state.current_bitrate = bitrate;
        self.state.last_level_change_at = Some(now);
        self.state.last_bitrate_change_at = Some(now);
        self.state.healthy_streak = 0;
        Adjustment::Level {
            level,
            width: quality.width,
            height: quality.height,
            bitrate,
        }
    }
}

fn cooled_down(last: Option<Instant>, now: Instant, cooldown: Duration) -> bool {
    last.map_or(true, |t| now.saturating_duration_since(t) >= cooldown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QualityLevel;
    use proptest::prelude::*;

    fn adapter() -> BitrateAdapter {
        BitrateAdapter::new(AdaptationConfig::default(), 2_000_000, 1920, 1080).unwrap()
    }

    fn sample(delay_ms: u32, loss: u32, queue_dropped: u64, send_errors: u64) -> LinkSample {
        LinkSample {
            stats: NetworkStats {
                bytes_sent: 0,
                delay_ms,
                packet_loss_percent: loss,
                dropped_frames: 0,
            },
            queue_dropped,
            send_errors,
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_congested_sample_jumps_to_lowest_level() {
        let mut adapter = adapter();
        let now = Instant::now();

        let adjustment = adapter.evaluate(&sample(600, 10, 15, 0), now);
        assert_eq!(
            adjustment,
            Adjustment::Level {
                level: 2,
                width: 854,
                height: 480,
                bitrate: 350_000
            }
        );
        assert_eq!(adapter.state().last_level_change_at, Some(now));
    }

    #[test]
    fn test_level_cooldown_prevents_second_change() {
        let mut config = AdaptationConfig::default();
        config.levels = vec![
            QualityLevel::new(1920, 1080, 2_000_000),
            QualityLevel::new(1280, 720, 1_200_000),
            QualityLevel::new(960, 540, 800_000),
            QualityLevel::new(854, 480, 500_000),
        ];
        let mut adapter = BitrateAdapter::new(config, 2_000_000, 1920, 1080).unwrap();
        let start = Instant::now();

        let first = adapter.evaluate(&sample(600, 10, 0, 0), start);
        assert!(matches!(first, Adjustment::Level { level: 2, .. }));

        for t in [4, 8] {
            let adjustment = adapter.evaluate(&sample(600, 10, 0, 0), start + secs(t));
            assert_eq!(adjustment, Adjustment::Hold, "tick at {}s", t);
            assert_eq!(adapter.current_level(), 2);
        }

        let later = adapter.evaluate(&sample(600, 10, 0, 0), start + secs(12));
        assert!(matches!(later, Adjustment::Level { level: 3, .. }));
    }

    #[test]
    fn test_bitrate_change_gated_by_cooldown() {
        let mut adapter = adapter();
        let start = Instant::now();

        // 8 drops over 6 s is a mild congestion rate.
        let first = adapter.evaluate(&sample(50, 0, 8, 0), start);
        assert_eq!(first, Adjustment::Bitrate { bitrate: 1_500_000 });

        let second = adapter.evaluate(&sample(50, 0, 16, 0), start + secs(6));
        assert_eq!(second, Adjustment::Hold);

        let third = adapter.evaluate(&sample(50, 0, 32, 0), start + secs(16));
        assert_eq!(third, Adjustment::Bitrate { bitrate: 1_125_000 });
    }

    #[test]
    fn test_small_bitrate_change_suppressed() {
        let mut adapter = adapter();
        let start = Instant::now();
        adapter.evaluate(&sample(900, 0, 0, 0), start);
        assert_eq!(adapter.current_bitrate(), 350_000);

        // Lowest level, degraded: 350k * 0.7 clamps back to 350k.
        let adjustment = adapter.evaluate(&sample(350, 0, 0, 0), start + secs(20));
        assert_eq!(adjustment, Adjustment::Hold);
        assert_eq!(adapter.current_bitrate(), 350_000);
    }

    #[test]
    fn test_recovery_steps_up_one_level_at_a_time() {
        let mut adapter = adapter();
        let start = Instant::now();
        adapter.evaluate(&sample(900, 0, 0, 0), start);
        assert_eq!(adapter.current_level(), 2);

        assert_eq!(adapter.evaluate(&sample(20, 0, 0, 0), start + secs(6)), Adjustment::Hold);
        assert_eq!(adapter.evaluate(&sample(20, 0, 0, 0), start + secs(12)), Adjustment::Hold);

        let up = adapter.evaluate(&sample(20, 0, 0, 0), start + secs(18));
        assert_eq!(
            up,
            Adjustment::Level {
                level: 1,
                width: 1280,
                height: 720,
                bitrate: 550_000
            }
        );

        assert_eq!(adapter.evaluate(&sample(20, 0, 0, 0), start + secs(24)), Adjustment::Hold);
        assert_eq!(adapter.evaluate(&sample(20, 0, 0, 0), start + secs(30)), Adjustment::Hold);

        let top = adapter.evaluate(&sample(20, 0, 0, 0), start + secs(36));
        assert_eq!(
            top,
            Adjustment::Level {
                level: 0,
                width: 1920,
                height: 1080,
                bitrate: 2_000_000
            }
        );
    }

    #[test]
    fn test_unconfirmed_health_does_not_step_up() {
        let mut adapter = adapter();
        let start = Instant::now();
        adapter.evaluate(&sample(900, 0, 0, 0), start);

        // Alternating healthy and borderline samples never build a streak.
        for t in 1..6 {
            let delay = if t % 2 == 0 { 20 } else { 90 };
            let adjustment = adapter.evaluate(&sample(delay, 0, 0, 0), start + secs(20 * t));
            assert_eq!(adjustment, Adjustment::Hold);
        }
        assert_eq!(adapter.current_level(), 2);
    }

    #[test]
    fn test_slow_increase_toward_base() {
        let mut adapter = adapter();
        let start = Instant::now();
        adapter.evaluate(&sample(50, 0, 8, 0), start);
        assert_eq!(adapter.current_bitrate(), 1_500_000);

        assert_eq!(adapter.evaluate(&sample(50, 0, 8, 0), start + secs(6)), Adjustment::Hold);

        let raised = adapter.evaluate(&sample(50, 0, 8, 0), start + secs(16));
        assert_eq!(raised, Adjustment::Bitrate { bitrate: 1_650_000 });
    }

    #[test]
    fn test_sampling_interval_follows_congestion() {
        let mut adapter = adapter();
        let start = Instant::now();
        assert_eq!(adapter.next_interval(), secs(6));

        adapter.evaluate(&sample(20, 0, 11, 0), start);
        assert_eq!(adapter.next_interval(), secs(4));

        adapter.evaluate(&sample(20, 0, 11, 3), start + secs(4));
        assert_eq!(adapter.next_interval(), secs(4));

        adapter.evaluate(&sample(20, 0, 11, 3), start + secs(8));
        assert_eq!(adapter.next_interval(), secs(6));
    }

    #[test]
    fn test_transport_and_queue_drops_combine() {
        let mut adapter = adapter();
        let mut s = sample(20, 0, 5, 0);
        s.stats.dropped_frames = 10;
        adapter.evaluate(&s, Instant::now());
        assert_eq!(adapter.state().last_dropped_sample, 15);
        assert_eq!(adapter.next_interval(), secs(4));
    }

    #[test]
    fn test_rebase_ignores_history() {
        let mut adapter = adapter();
        let start = Instant::now();
        adapter.rebase(&sample(20, 0, 1000, 50), start);
        let adjustment = adapter.evaluate(&sample(20, 0, 1000, 50), start + secs(6));
        assert_eq!(adjustment, Adjustment::Hold);
        assert_eq!(adapter.current_level(), 0);
    }

    #[test]
    fn test_set_bitrate_clamps_and_sets_base() {
        let mut adapter = adapter();
        let now = Instant::now();
        assert_eq!(adapter.set_bitrate(10_000_000, now), 5_000_000);
        assert_eq!(adapter.state().base_bitrate, 5_000_000);
        assert_eq!(adapter.set_bitrate(100_000, now), 350_000);
    }

    #[test]
    fn test_update_level_for_resolution() {
        let mut adapter = adapter();
        assert_eq!(adapter.update_level_for_resolution(854, 480), Some(2));
        assert_eq!(adapter.current_bitrate(), 450_000);
        assert_eq!(adapter.update_level_for_resolution(1000, 1000), None);
        assert_eq!(adapter.current_level(), 2);
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let mut adapter = adapter();
        adapter.evaluate(&sample(900, 0, 0, 0), Instant::now());
        adapter.reset();
        assert_eq!(adapter.current_level(), 0);
        assert_eq!(adapter.current_bitrate(), 2_000_000);
        assert!(adapter.state().last_level_change_at.is_none());
    }

    #[test]
    fn test_initial_level_follows_resolution() {
        let mut adapter =
            BitrateAdapter::new(AdaptationConfig::default(), 2_000_000, 1280, 720).unwrap();
        assert_eq!(adapter.current_level(), 1);
        assert_eq!(adapter.current_bitrate(), 1_200_000);
        assert_eq!(adapter.state().base_bitrate, 2_000_000);

        // 11 drops/s at 720p is degraded past the hold band: step to 480p.
        let start = Instant::now();
        let adjustment = adapter.evaluate(&sample(50, 0, 66, 0), start);
        assert!(matches!(adjustment, Adjustment::Level { level: 2, .. }));

        adapter.reset();
        assert_eq!(adapter.current_level(), 1);
        assert_eq!(adapter.current_bitrate(), 1_200_000);

        let unknown =
            BitrateAdapter::new(AdaptationConfig::default(), 2_000_000, 640, 360).unwrap();
        assert_eq!(unknown.current_level(), 0);
    }

    #[test]
    fn test_level_change_respects_level_ceiling() {
        let mut adapter = adapter();
        let start = Instant::now();
        assert_eq!(adapter.set_bitrate(5_000_000, start), 5_000_000);

        let adjustment = adapter.evaluate(&sample(320, 0, 0, 0), start + secs(1));
        assert_eq!(
            adjustment,
            Adjustment::Level {
                level: 1,
                width: 1280,
                height: 720,
                bitrate: 1_200_000
            }
        );
    }

    proptest! {
        #[test]
        fn test_bitrate_stays_within_bounds(
            steps in proptest::collection::vec(
                (0u32..1500, 0u32..30, 0u64..50, 0u64..10, 1u64..30, proptest::option::of(0u32..8_000_000)),
                1..40,
            ),
        ) {
            let config = AdaptationConfig::default();
            let mut adapter = adapter();
            let mut now = Instant::now();
            let (mut dropped, mut errors) = (0u64, 0u64);

            for (delay, loss, new_drops, new_errors, step, manual) in steps {
                now += secs(step);
                dropped += new_drops;
                errors += new_errors;
                if let Some(bitrate) = manual {
                    adapter.set_bitrate(bitrate, now);
                }
                adapter.evaluate(&sample(delay, loss, dropped, errors), now);

                let level = adapter.current_level();
                let bitrate = adapter.current_bitrate();
                prop_assert!(level < adapter.table().len());
                prop_assert!(bitrate >= config.min_bitrate);
                prop_assert!(bitrate <= config.max_bitrate);
                prop_assert!(bitrate <= adapter.table().level(level).bitrate_ceiling);
                if adapter.table().is_lowest(level) {
                    prop_assert!(bitrate <= config.lowest_level_bitrate_cap);
                }
            }
        }
    }
}
