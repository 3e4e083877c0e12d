//! Configuration module for pingtrail.
//!
//! Loads probe settings from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Default retained samples per target (one hour at the default interval).
pub const DEFAULT_HISTORY_CAP: usize = 3600;

/// Configuration errors.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("interval must be positive, got {0:?}")]
    Interval(Duration),
    #[error("timeout must be positive, got {0:?}")]
    Timeout(Duration),
    #[error("max_in_flight must be at least 1")]
    MaxInFlight,
    #[error("invalid duration {0}: expected a positive number of seconds")]
    Seconds(f64),
}

/// Probe settings shared by the single-target loop and the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSettings {
    /// Time between probe cycles (default: 1s)
    pub interval: Duration,
    /// Per-probe timeout (default: 2s)
    pub timeout: Duration,
    /// Samples kept per target; `None` keeps everything (default: 3600)
    pub history_cap: Option<usize>,
    /// Concurrent probes within one scheduler cycle (default: 32)
    pub max_in_flight: usize,
    /// Fall back to the system `ping` command without ICMP privileges (default: false)
    pub command_fallback: bool,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(2),
            history_cap: Some(DEFAULT_HISTORY_CAP),
            max_in_flight: 32,
            command_fallback: false,
        }
    }
}

impl ProbeSettings {
    /// Defaults tuned for sweeping many hosts: a shorter per-probe timeout.
    pub fn multi_target() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Load settings from environment variables on top of `self`.
    ///
    /// Environment variables:
    /// - `PINGTRAIL_INTERVAL`: seconds between cycles
    /// - `PINGTRAIL_TIMEOUT`: seconds per probe
    /// - `PINGTRAIL_HISTORY_CAP`: samples per target, 0 for unbounded
    /// - `PINGTRAIL_MAX_IN_FLIGHT`: concurrent probes per cycle
    /// - `PINGTRAIL_COMMAND_FALLBACK`: `1`, `true` or `yes` to enable
    pub fn load(self) -> Self {
        self.load_from(|key| env::var(key).ok())
    }

    fn load_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(secs) = parse_var::<f64>(&lookup, "PINGTRAIL_INTERVAL") {
            match seconds(secs) {
                Ok(d) => self.interval = d,
                Err(e) => tracing::warn!("Ignoring PINGTRAIL_INTERVAL: {}", e),
            }
        }

        if let Some(secs) = parse_var::<f64>(&lookup, "PINGTRAIL_TIMEOUT") {
            match seconds(secs) {
                Ok(d) => self.timeout = d,
                Err(e) => tracing::warn!("Ignoring PINGTRAIL_TIMEOUT: {}", e),
            }
        }

        if let Some(cap) = parse_var::<usize>(&lookup, "PINGTRAIL_HISTORY_CAP") {
            self.history_cap = (cap > 0).then_some(cap);
        }

        if let Some(n) = parse_var::<usize>(&lookup, "PINGTRAIL_MAX_IN_FLIGHT") {
            self.max_in_flight = n;
        }

        if let Some(flag) = lookup("PINGTRAIL_COMMAND_FALLBACK") {
            self.command_fallback = matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        self
    }

    /// Check the settings can drive a run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::Interval(self.interval));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Timeout(self.timeout));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::MaxInFlight);
        }
        Ok(())
    }
}

/// Convert a positive, finite number of seconds into a duration.
pub fn seconds(secs: f64) -> Result<Duration, ConfigError> {
    if secs.is_finite() && secs > 0.0 {
        Ok(Duration::from_secs_f64(secs))
    } else {
        Err(ConfigError::Seconds(secs))
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}
