//! Tunable constants for sessions, auto-save, critical state and messaging
//!
//! All values are fixed when a [`ProfileRuntime`](crate::ProfileRuntime) is
//! built. Defaults can be overridden with the builder methods, by name via
//! [`ProfileStoreConfig::set_constant`], or from `PROFILE_STORE_*`
//! environment variables (durations in seconds).

use crate::error::{ProfileStoreError, Result};
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const MIN_AUTO_SAVE_TICK: Duration = Duration::from_millis(1);
const MAX_AUTO_SAVE_TICK: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Convert a whole, positive `value` into a count type
fn whole_count<T: TryFrom<u64>>(name: ConstantName, value: f64) -> Result<T> {
    let out_of_range =
        || ProfileStoreError::InvalidConfig(format!("{} = {} is out of range", name, value));
    // 2^64 and above cannot be represented by any count type
    if value >= u64::MAX as f64 {
        return Err(out_of_range());
    }
    T::try_from(value as u64).map_err(|_| out_of_range())
}

/// Names of the tunable constants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstantName {
    AutoSavePeriod,
    LoadRepeatPeriod,
    FirstLoadRepeat,
    SessionSteal,
    AssumeDead,
    StartSessionTimeout,
    CriticalStateErrorCount,
    CriticalStateErrorExpire,
    CriticalStateExpire,
    MaxMessageQueue,
}

impl ConstantName {
    pub const ALL: [ConstantName; 10] = [
        ConstantName::AutoSavePeriod,
        ConstantName::LoadRepeatPeriod,
        ConstantName::FirstLoadRepeat,
        ConstantName::SessionSteal,
        ConstantName::AssumeDead,
        ConstantName::StartSessionTimeout,
        ConstantName::CriticalStateErrorCount,
        ConstantName::CriticalStateErrorExpire,
        ConstantName::CriticalStateExpire,
        ConstantName::MaxMessageQueue,
    ];

    /// Upper-case constant name, e.g. `AUTO_SAVE_PERIOD`
    pub fn as_str(&self) -> &'static str {
        match self {
            ConstantName::AutoSavePeriod => "AUTO_SAVE_PERIOD",
            ConstantName::LoadRepeatPeriod => "LOAD_REPEAT_PERIOD",
            ConstantName::FirstLoadRepeat => "FIRST_LOAD_REPEAT",
            ConstantName::SessionSteal => "SESSION_STEAL",
            ConstantName::AssumeDead => "ASSUME_DEAD",
            ConstantName::StartSessionTimeout => "START_SESSION_TIMEOUT",
            ConstantName::CriticalStateErrorCount => "CRITICAL_STATE_ERROR_COUNT",
            ConstantName::CriticalStateErrorExpire => "CRITICAL_STATE_ERROR_EXPIRE",
            ConstantName::CriticalStateExpire => "CRITICAL_STATE_EXPIRE",
            ConstantName::MaxMessageQueue => "MAX_MESSAGE_QUEUE",
        }
    }

    /// Whether the constant is a count rather than a duration
    pub fn is_count(&self) -> bool {
        matches!(
            self,
            ConstantName::CriticalStateErrorCount | ConstantName::MaxMessageQueue
        )
    }
}

impl fmt::Display for ConstantName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConstantName {
    type Err = ProfileStoreError;

    fn from_str(s: &str) -> Result<Self> {
        ConstantName::ALL
            .iter()
            .copied()
            .find(|name| name.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ProfileStoreError::InvalidConfig(format!("Unknown constant: {}", s)))
    }
}

/// Configuration for a profile runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileStoreConfig {
    /// Period between auto-save ticks of an active session
    pub auto_save_period: Duration,

    /// Poll period while waiting for another owner to release a session
    pub load_repeat_period: Duration,

    /// First poll period, shorter than the steady-state one
    pub first_load_repeat: Duration,

    /// Grace period a stealer waits for the owner to release before force-claiming
    pub session_steal: Duration,

    /// Heartbeat age after which an owner is assumed dead
    pub assume_dead: Duration,

    /// Overall budget for session acquisition
    pub start_session_timeout: Duration,

    /// Number of chained store errors that flips critical state
    pub critical_state_error_count: u32,

    /// Maximum gap between two errors for them to count as chained
    pub critical_state_error_expire: Duration,

    /// Quiet period after which critical state clears on its own
    pub critical_state_expire: Duration,

    /// Maximum number of queued messages per document
    pub max_message_queue: usize,

    /// Retry policy for transient store failures
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ProfileStoreConfig {
    fn default() -> Self {
        Self {
            auto_save_period: Duration::from_secs(300),
            load_repeat_period: Duration::from_secs(10),
            first_load_repeat: Duration::from_secs(5),
            session_steal: Duration::from_secs(40),
            assume_dead: Duration::from_secs(630),
            start_session_timeout: Duration::from_secs(120),
            critical_state_error_count: 5,
            critical_state_error_expire: Duration::from_secs(120),
            critical_state_expire: Duration::from_secs(120),
            max_message_queue: 1000,
            retry: RetryConfig::default(),
        }
    }
}

impl ProfileStoreConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables only
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Each constant is read from `PROFILE_STORE_<NAME>`, e.g.
    /// `PROFILE_STORE_AUTO_SAVE_PERIOD=60`. Durations are in seconds and may
    /// be fractional. `PROFILE_STORE_MAX_RETRIES` overrides the retry budget.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        for name in ConstantName::ALL {
            let var = format!("PROFILE_STORE_{}", name.as_str());
            if let Ok(raw) = env::var(&var) {
                let value = raw.trim().parse::<f64>().map_err(|_| {
                    ProfileStoreError::InvalidConfig(format!("{} must be numeric, got {:?}", var, raw))
                })?;
                self.set_constant(name, value)?;
            }
        }

        if let Ok(retries) = env::var("PROFILE_STORE_MAX_RETRIES") {
            if let Ok(value) = retries.trim().parse::<u32>() {
                self.retry.max_retries = value;
            }
        }

        Ok(())
    }

    /// Change one constant by name. Durations are given in seconds.
    pub fn set_constant(&mut self, name: ConstantName, value: f64) -> Result<()> {
        if !value.is_finite() || value <= 0.0 {
            return Err(ProfileStoreError::InvalidConfig(format!(
                "{} must be a positive number, got {}",
                name, value
            )));
        }

        if name.is_count() && value.fract() != 0.0 {
            return Err(ProfileStoreError::InvalidConfig(format!(
                "{} must be a whole number, got {}",
                name, value
            )));
        }

        if name.is_count() {
            match name {
                ConstantName::CriticalStateErrorCount => {
                    self.critical_state_error_count = whole_count(name, value)?
                }
                _ => self.max_message_queue = whole_count(name, value)?,
            }
            return Ok(());
        }

        let duration = Duration::try_from_secs_f64(value)
            .map_err(|e| ProfileStoreError::InvalidConfig(format!("{} = {}: {}", name, value, e)))?;
        if duration.is_zero() {
            return Err(ProfileStoreError::InvalidConfig(format!(
                "{} = {} rounds down to zero",
                name, value
            )));
        }
        match name {
            ConstantName::AutoSavePeriod => self.auto_save_period = duration,
            ConstantName::LoadRepeatPeriod => self.load_repeat_period = duration,
            ConstantName::FirstLoadRepeat => self.first_load_repeat = duration,
            ConstantName::SessionSteal => self.session_steal = duration,
            ConstantName::AssumeDead => self.assume_dead = duration,
            ConstantName::StartSessionTimeout => self.start_session_timeout = duration,
            ConstantName::CriticalStateErrorExpire => self.critical_state_error_expire = duration,
            ConstantName::CriticalStateExpire => self.critical_state_expire = duration,
            ConstantName::CriticalStateErrorCount | ConstantName::MaxMessageQueue => {}
        }
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let durations = [
            (ConstantName::AutoSavePeriod, self.auto_save_period),
            (ConstantName::LoadRepeatPeriod, self.load_repeat_period),
            (ConstantName::FirstLoadRepeat, self.first_load_repeat),
            (ConstantName::SessionSteal, self.session_steal),
            (ConstantName::AssumeDead, self.assume_dead),
            (ConstantName::StartSessionTimeout, self.start_session_timeout),
            (ConstantName::CriticalStateErrorExpire, self.critical_state_error_expire),
            (ConstantName::CriticalStateExpire, self.critical_state_expire),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ProfileStoreError::InvalidConfig(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.heartbeat_refresh().is_zero() {
            return Err(ProfileStoreError::InvalidConfig(format!(
                "ASSUME_DEAD is too small to schedule heartbeats: {:?}",
                self.assume_dead
            )));
        }

        if self.critical_state_error_count == 0 {
            return Err(ProfileStoreError::InvalidConfig(
                "CRITICAL_STATE_ERROR_COUNT must be greater than 0".to_string(),
            ));
        }

        if self.max_message_queue == 0 {
            return Err(ProfileStoreError::InvalidConfig(
                "MAX_MESSAGE_QUEUE must be greater than 0".to_string(),
            ));
        }

        if self.retry.backoff_multiplier < 1.0 {
            return Err(ProfileStoreError::InvalidConfig(format!(
                "backoff multiplier must be at least 1.0, got {}",
                self.retry.backoff_multiplier
            )));
        }

        Ok(())
    }

    /// Heartbeat age after which a periodic tick writes even without changes
    pub fn heartbeat_refresh(&self) -> Duration {
        self.assume_dead / 4
    }

    /// Period of the auto-save task, kept within what timers can schedule
    pub(crate) fn auto_save_tick(&self) -> Duration {
        self.auto_save_period
            .min(self.heartbeat_refresh())
            .clamp(MIN_AUTO_SAVE_TICK, MAX_AUTO_SAVE_TICK)
    }

    pub fn with_auto_save_period(mut self, period: Duration) -> Self {
        self.auto_save_period = period;
        self
    }

    pub fn with_load_repeat_period(mut self, period: Duration) -> Self {
        self.load_repeat_period = period;
        self
    }

    pub fn with_first_load_repeat(mut self, period: Duration) -> Self {
        self.first_load_repeat = period;
        self
    }

    pub fn with_session_steal(mut self, grace: Duration) -> Self {
        self.session_steal = grace;
        self
    }

    pub fn with_assume_dead(mut self, threshold: Duration) -> Self {
        self.assume_dead = threshold;
        self
    }

    pub fn with_start_session_timeout(mut self, timeout: Duration) -> Self {
        self.start_session_timeout = timeout;
        self
    }

    pub fn with_critical_state_error_count(mut self, count: u32) -> Self {
        self.critical_state_error_count = count;
        self
    }

    pub fn with_critical_state_error_expire(mut self, window: Duration) -> Self {
        self.critical_state_error_expire = window;
        self
    }

    pub fn with_critical_state_expire(mut self, cooldown: Duration) -> Self {
        self.critical_state_expire = cooldown;
        self
    }

    pub fn with_max_message_queue(mut self, max: usize) -> Self {
        self.max_message_queue = max;
        self
    }

    /// Set retry configuration
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ProfileStoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.auto_save_period, Duration::from_secs(300));
        assert_eq!(config.assume_dead, Duration::from_secs(630));
        assert_eq!(config.critical_state_error_count, 5);
        assert_eq!(config.max_message_queue, 1000);
    }

    #[test]
    fn test_set_constant_by_name() {
        let mut config = ProfileStoreConfig::default();
        let name: ConstantName = "session_steal".parse().unwrap();
        config.set_constant(name, 2.5).unwrap();
        assert_eq!(config.session_steal, Duration::from_millis(2500));

        config
            .set_constant(ConstantName::MaxMessageQueue, 10.0)
            .unwrap();
        assert_eq!(config.max_message_queue, 10);
    }

    #[test]
    fn test_set_constant_rejects_bad_values() {
        let mut config = ProfileStoreConfig::default();
        assert!(config.set_constant(ConstantName::AssumeDead, 0.0).is_err());
        assert!(config.set_constant(ConstantName::AssumeDead, -3.0).is_err());
        assert!(config
            .set_constant(ConstantName::CriticalStateErrorCount, 1.5)
            .is_err());
        assert!("NOT_A_CONSTANT".parse::<ConstantName>().is_err());
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = ProfileStoreConfig::default().with_auto_save_period(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = ProfileStoreConfig::default().with_max_message_queue(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_set_constant_rejects_out_of_range_values() {
        let mut config = ProfileStoreConfig::default();
        assert!(matches!(
            config.set_constant(ConstantName::AssumeDead, 1e20),
            Err(ProfileStoreError::InvalidConfig(_))
        ));
        assert!(config.set_constant(ConstantName::AssumeDead, 1e-12).is_err());
        assert!(config
            .set_constant(ConstantName::CriticalStateErrorCount, 1e10)
            .is_err());
        assert!(config.set_constant(ConstantName::MaxMessageQueue, 1e30).is_err());
        assert_eq!(config, ProfileStoreConfig::default());
    }

    #[test]
    fn test_large_durations_are_accepted() {
        let mut config = ProfileStoreConfig::default();
        config.set_constant(ConstantName::AutoSavePeriod, 1e15).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.auto_save_tick(), config.heartbeat_refresh());

        let config = ProfileStoreConfig::default()
            .with_auto_save_period(Duration::MAX)
            .with_assume_dead(Duration::MAX);
        assert!(config.validate().is_ok());
        assert_eq!(config.auto_save_tick(), MAX_AUTO_SAVE_TICK);
    }

    #[test]
    fn test_validate_rejects_assume_dead_without_heartbeat_room() {
        let config = ProfileStoreConfig::default().with_assume_dead(Duration::from_nanos(3));
        assert!(matches!(
            config.validate(),
            Err(ProfileStoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_auto_save_tick_has_a_floor() {
        let config = ProfileStoreConfig::default()
            .with_auto_save_period(Duration::from_nanos(1))
            .with_assume_dead(Duration::from_nanos(8));
        assert!(config.validate().is_ok());
        assert_eq!(config.auto_save_tick(), Duration::from_millis(1));
    }

    #[test]
    fn test_heartbeat_refresh() {
        let config = ProfileStoreConfig::default().with_assume_dead(Duration::from_secs(400));
        assert_eq!(config.heartbeat_refresh(), Duration::from_secs(100));
    }
}
