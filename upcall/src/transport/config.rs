//! Staged timeout and transport configuration.
//!
//! A command lives through up to three timeout stages:
//!
//! - **T1** (`first_stage`): queued, waiting for the consumer to pull it.
//! - **T2** (`second_stage`): pulled, waiting for an acknowledgment or reply.
//! - **T3** (`third_stage`): acknowledged, waiting for the final reply.
//!
//! Each stage replaces the previous deadline, so T1 < T2 < T3 gives a
//! consumer that has shown signs of life progressively more room.
//!
//! # Tuning Guidelines
//!
//! - **Local daemons doing in-memory work**: use [`TimeoutConfig::local`].
//! - **Interactive filesystem traffic**: the default.
//! - **Bulk transfers over slow backends**: use [`TimeoutConfig::bulk`].

use std::time::Duration;

use thiserror::Error;

use crate::timing::PowerOfTwo;

/// Invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A stage budget is zero.
    #[error("{0} timeout must be non-zero")]
    ZeroStage(&'static str),
    /// Stage budgets are not strictly increasing.
    #[error("stage timeouts must increase: T1 {t1:?} < T2 {t2:?} < T3 {t3:?}")]
    StagesOutOfOrder {
        t1: Duration,
        t2: Duration,
        t3: Duration,
    },
    /// Timer tick is zero or coarser than the first stage.
    #[error("tick {tick:?} must be non-zero and at most the first stage {first_stage:?}")]
    InvalidTick { tick: Duration, first_stage: Duration },
    /// A stage budget exceeds [`MAX_STAGE`].
    #[error("{stage} timeout {budget:?} exceeds the one year limit")]
    StageTooLong { stage: &'static str, budget: Duration },
    /// Timing wheel slot count is not a power of two.
    #[error("wheel slots must be a power of two, got {0}")]
    WheelSlots(usize),
}

/// Longest budget any stage may use.
///
/// Budgets beyond this are clamped when armed, so an "unlimited" request
/// still yields a representable deadline.
pub const MAX_STAGE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Budgets for the three timeout stages and the supervisor tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Budget for a queued command to be pulled.
    ///
    /// **Default**: 5s
    pub first_stage: Duration,

    /// Budget for a pulled command to be acknowledged or answered.
    ///
    /// **Default**: 30s
    pub second_stage: Duration,

    /// Budget for an acknowledged command to be answered.
    ///
    /// **Default**: 120s
    pub third_stage: Duration,

    /// Granularity of the timeout supervisor. Deadlines fire at most one
    /// tick late.
    ///
    /// **Default**: 10ms
    pub tick: Duration,
}

impl TimeoutConfig {
    /// Preset for a daemon on the same host doing cheap work.
    #[must_use]
    pub const fn local() -> Self {
        Self {
            first_stage: Duration::from_millis(500),
            second_stage: Duration::from_secs(2),
            third_stage: Duration::from_secs(10),
            tick: Duration::from_millis(1),
        }
    }

    /// Preset for interactive filesystem traffic. Same as the default.
    #[must_use]
    pub const fn interactive() -> Self {
        Self {
            first_stage: Duration::from_secs(5),
            second_stage: Duration::from_secs(30),
            third_stage: Duration::from_secs(120),
            tick: Duration::from_millis(10),
        }
    }

    /// Preset for long transfers where the daemon may stall on its backend.
    #[must_use]
    pub const fn bulk() -> Self {
        Self {
            first_stage: Duration::from_secs(30),
            second_stage: Duration::from_secs(120),
            third_stage: Duration::from_secs(600),
            tick: Duration::from_millis(50),
        }
    }

    /// Builder-style setter for the first stage.
    #[must_use]
    pub const fn with_first_stage(mut self, budget: Duration) -> Self {
        self.first_stage = budget;
        self
    }

    /// Builder-style setter for the second stage.
    #[must_use]
    pub const fn with_second_stage(mut self, budget: Duration) -> Self {
        self.second_stage = budget;
        self
    }

    /// Builder-style setter for the third stage.
    #[must_use]
    pub const fn with_third_stage(mut self, budget: Duration) -> Self {
        self.third_stage = budget;
        self
    }

    /// Builder-style setter for the supervisor tick.
    #[must_use]
    pub const fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// First stage budget for a command, honouring a per-request override.
    ///
    /// The override is clamped below the second stage so a queued command
    /// never outlives a pulled one.
    #[must_use]
    pub fn first_stage_for(&self, requested: Option<Duration>) -> Duration {
        match requested {
            None => self.first_stage,
            Some(budget) => budget.min(self.second_stage.saturating_sub(self.tick)),
        }
    }

    /// Checks `0 < T1 < T2 < T3 <= MAX_STAGE` and `0 < tick <= T1`.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, stage) in [
            ("first stage", self.first_stage),
            ("second stage", self.second_stage),
            ("third stage", self.third_stage),
        ] {
            if stage.is_zero() {
                return Err(ConfigError::ZeroStage(name));
            }
            if stage > MAX_STAGE {
                return Err(ConfigError::StageTooLong {
                    stage: name,
                    budget: stage,
                });
            }
        }
        if !(self.first_stage < self.second_stage && self.second_stage < self.third_stage) {
            return Err(ConfigError::StagesOutOfOrder {
                t1: self.first_stage,
                t2: self.second_stage,
                t3: self.third_stage,
            });
        }
        if self.tick.is_zero() || self.tick > self.first_stage {
            return Err(ConfigError::InvalidTick {
                tick: self.tick,
                first_stage: self.first_stage,
            });
        }
        Ok(())
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Configuration for a [`Transport`](crate::Transport).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Staged timeout budgets.
    pub timeouts: TimeoutConfig,
    /// Timing wheel slots; must be a power of two.
    ///
    /// **Default**: 1024
    pub wheel_slots: usize,
    /// Name used in log output and as the timer thread's name suffix.
    ///
    /// **Default**: `"upcall"`
    pub name: String,
}

impl TransportConfig {
    /// Builder-style setter for the timeout budgets.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Builder-style setter for the wheel slot count.
    #[must_use]
    pub fn with_wheel_slots(mut self, slots: usize) -> Self {
        self.wheel_slots = slots;
        self
    }

    /// Builder-style setter for the transport name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Validates the timeouts and returns the checked slot count.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<PowerOfTwo, ConfigError> {
        self.timeouts.validate()?;
        PowerOfTwo::new(self.wheel_slots).ok_or(ConfigError::WheelSlots(self.wheel_slots))
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            wheel_slots: 1024,
            name: "upcall".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        for config in [
            TimeoutConfig::local(),
            TimeoutConfig::interactive(),
            TimeoutConfig::bulk(),
        ] {
            assert_eq!(config.validate(), Ok(()));
        }
        assert_eq!(TimeoutConfig::default(), TimeoutConfig::interactive());
    }

    #[test]
    fn presets_have_increasing_tolerance() {
        let local = TimeoutConfig::local();
        let interactive = TimeoutConfig::interactive();
        let bulk = TimeoutConfig::bulk();

        assert!(local.first_stage <= interactive.first_stage);
        assert!(interactive.first_stage <= bulk.first_stage);
        assert!(local.third_stage <= interactive.third_stage);
        assert!(interactive.third_stage <= bulk.third_stage);
    }

    #[test]
    fn builder_pattern() {
        let config = TimeoutConfig::default()
            .with_first_stage(Duration::from_millis(40))
            .with_second_stage(Duration::from_millis(80))
            .with_third_stage(Duration::from_millis(160))
            .with_tick(Duration::from_millis(2));

        assert_eq!(config.first_stage, Duration::from_millis(40));
        assert_eq!(config.third_stage, Duration::from_millis(160));
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn zero_stage_rejected() {
        let config = TimeoutConfig::local().with_second_stage(Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::ZeroStage("second stage")));
    }

    #[test]
    fn stages_must_increase() {
        let config = TimeoutConfig::local().with_third_stage(Duration::from_secs(2));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::StagesOutOfOrder { .. })
        ));
    }

    #[test]
    fn unbounded_stage_rejected() {
        let config = TimeoutConfig::local().with_third_stage(Duration::MAX);
        assert_eq!(
            config.validate(),
            Err(ConfigError::StageTooLong {
                stage: "third stage",
                budget: Duration::MAX
            })
        );
        let config = TimeoutConfig::local().with_third_stage(MAX_STAGE);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn first_stage_override_stays_below_second_stage() {
        let config = TimeoutConfig::local();
        assert_eq!(config.first_stage_for(None), config.first_stage);
        assert_eq!(
            config.first_stage_for(Some(Duration::from_millis(20))),
            Duration::from_millis(20)
        );
        // Longer than the default is fine as long as it stays under T2.
        assert_eq!(
            config.first_stage_for(Some(Duration::from_secs(1))),
            Duration::from_secs(1)
        );
        for requested in [config.second_stage, config.third_stage, Duration::MAX] {
            let budget = config.first_stage_for(Some(requested));
            assert!(budget < config.second_stage, "{requested:?} -> {budget:?}");
            assert!(budget >= config.first_stage);
        }
    }

    #[test]
    fn tick_must_fit_in_first_stage() {
        let config = TimeoutConfig::local().with_tick(Duration::from_secs(1));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTick { .. })
        ));
        let config = TimeoutConfig::local().with_tick(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn wheel_slots_must_be_power_of_two() {
        let config = TransportConfig::default().with_wheel_slots(1000);
        assert_eq!(config.validate(), Err(ConfigError::WheelSlots(1000)));
        let config = TransportConfig::default().with_wheel_slots(256);
        assert_eq!(config.validate().map(PowerOfTwo::get), Ok(256));
    }
}
