//! Collector settings, supplied as a nested mapping:
//!
//! ```json
//! {
//!   "rate_limit": { "max_requests": 30, "window_seconds": 60 },
//!   "circuit_breaker": { "failure_threshold": 3, "recovery_timeout": 10 },
//!   "retry": { "strategy": "fibonacci", "max_attempts": 4, "base_delay": 0.5 }
//! }
//! ```
//!
//! Missing keys take their defaults. Durations are seconds and may be
//! fractional.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{AppError, ErrorKind};
use crate::rate_limit::RateLimitConfig;
use crate::retry::{RetryConfig, RetryStrategy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    /// Seconds.
    pub recovery_timeout: f64,
    pub success_threshold: u32,
    pub countable: Vec<ErrorKind>,
    pub throttle_backoff_multiplier: f32,
    /// Seconds.
    pub max_recovery_timeout: f64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            recovery_timeout: defaults.recovery_timeout.as_secs_f64(),
            success_threshold: defaults.success_threshold,
            countable: ErrorKind::transient().to_vec(),
            throttle_backoff_multiplier: defaults.throttle_backoff_multiplier,
            max_recovery_timeout: defaults.max_recovery_timeout.as_secs_f64(),
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_config(&self) -> Result<CircuitBreakerConfig, AppError> {
        let config = CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            recovery_timeout: seconds("circuit_breaker.recovery_timeout", self.recovery_timeout)?,
            countable: self.countable.iter().copied().collect(),
            throttle_backoff_multiplier: self.throttle_backoff_multiplier,
            max_recovery_timeout: seconds(
                "circuit_breaker.max_recovery_timeout",
                self.max_recovery_timeout,
            )?,
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub strategy: RetryStrategy,
    pub max_attempts: u32,
    /// Seconds.
    pub base_delay: f64,
    /// Seconds.
    pub max_delay: f64,
    pub jitter: bool,
    pub backoff_factor: f64,
    pub retryable: Vec<ErrorKind>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            strategy: defaults.strategy,
            max_attempts: defaults.max_attempts,
            base_delay: defaults.base_delay.as_secs_f64(),
            max_delay: defaults.max_delay.as_secs_f64(),
            jitter: defaults.jitter,
            backoff_factor: defaults.backoff_factor,
            retryable: ErrorKind::transient().to_vec(),
        }
    }
}

impl RetrySettings {
    pub fn to_config(&self) -> Result<RetryConfig, AppError> {
        let config = RetryConfig {
            max_attempts: self.max_attempts,
            base_delay: seconds("retry.base_delay", self.base_delay)?,
            max_delay: seconds("retry.max_delay", self.max_delay)?,
            strategy: self.strategy,
            jitter: self.jitter,
            backoff_factor: self.backoff_factor,
            retryable: self.retryable.iter().copied().collect(),
            on_retry: None,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Bounds for the optional in-process result cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub max_capacity: u64,
    /// Seconds.
    pub ttl_seconds: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_capacity: 1_000,
            ttl_seconds: 300,
        }
    }
}

/// Complete protection settings for one collector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    pub retry: RetrySettings,
    /// Result caching is off unless this section is present.
    pub cache: Option<CacheSettings>,
}

impl CollectorSettings {
    pub fn from_value(value: Value) -> Result<Self, AppError> {
        let settings: Self = serde_json::from_value(value)
            .map_err(|e| AppError::Config(format!("Invalid collector settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Cannot read settings file '{}': {e}", path.display()))
        })?;
        let value: Value = serde_json::from_str(&raw).map_err(|e| {
            AppError::Config(format!("Invalid JSON in '{}': {e}", path.display()))
        })?;
        Self::from_value(value)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        self.rate_limit.validate()?;
        self.circuit_breaker.to_config()?;
        self.retry.to_config()?;
        if let Some(cache) = &self.cache
            && (cache.max_capacity == 0 || cache.ttl_seconds == 0)
        {
            return Err(AppError::Config(
                "cache.max_capacity and cache.ttl_seconds must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration, AppError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| AppError::Config(format!("{field} must be a non-negative number of seconds")))
}
