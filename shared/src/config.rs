use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Timing and sizing knobs for the sync layer and the dispatch tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub emergency_case_poll_ms: u64,
    pub emergency_list_poll_ms: u64,
    pub location_timeout_ms: u64,
    pub eta_tick_ms: u64,
    pub initial_eta_minutes: u32,
    pub cache_capacity: usize,
    /// Capacity of the cache event channel; slow subscribers past this re-read the cache.
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            emergency_case_poll_ms: 3_000,
            emergency_list_poll_ms: 5_000,
            location_timeout_ms: 10_000,
            eta_tick_ms: 60_000,
            initial_eta_minutes: 8,
            cache_capacity: 512,
            event_buffer: 256,
        }
    }
}

impl SyncConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.emergency_case_poll_ms == 0 {
            return Err(ConfigError::Invalid("emergency_case_poll_ms must be > 0".into()));
        }
        if self.emergency_list_poll_ms == 0 {
            return Err(ConfigError::Invalid("emergency_list_poll_ms must be > 0".into()));
        }
        if self.location_timeout_ms == 0 {
            return Err(ConfigError::Invalid("location_timeout_ms must be > 0".into()));
        }
        if self.eta_tick_ms == 0 {
            return Err(ConfigError::Invalid("eta_tick_ms must be > 0".into()));
        }
        if self.initial_eta_minutes == 0 {
            return Err(ConfigError::Invalid("initial_eta_minutes must be >= 1".into()));
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::Invalid("cache_capacity must be > 0".into()));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid("event_buffer must be > 0".into()));
        }
        Ok(())
    }

    #[must_use]
    pub const fn emergency_case_poll(&self) -> Duration {
        Duration::from_millis(self.emergency_case_poll_ms)
    }

    #[must_use]
    pub const fn emergency_list_poll(&self) -> Duration {
        Duration::from_millis(self.emergency_list_poll_ms)
    }

    #[must_use]
    pub const fn location_timeout(&self) -> Duration {
        Duration::from_millis(self.location_timeout_ms)
    }

    #[must_use]
    pub const fn eta_tick(&self) -> Duration {
        Duration::from_millis(self.eta_tick_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.emergency_case_poll(), Duration::from_secs(3));
        assert_eq!(config.emergency_list_poll(), Duration::from_secs(5));
        assert_eq!(config.location_timeout(), Duration::from_secs(10));
        assert_eq!(config.eta_tick(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SyncConfig::from_json(r#"{ "emergency_case_poll_ms": 1500 }"#).unwrap();
        assert_eq!(config.emergency_case_poll_ms, 1500);
        assert_eq!(config.emergency_list_poll_ms, 5_000);
        assert_eq!(config.initial_eta_minutes, 8);
    }

    #[test]
    fn test_rejects_zero_values() {
        assert!(matches!(
            SyncConfig::from_json(r#"{ "eta_tick_ms": 0 }"#),
            Err(ConfigError::Invalid(_))
        ));
        let config = SyncConfig {
            cache_capacity: 0,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            SyncConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
