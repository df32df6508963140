use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failure, used by the retry and circuit breaker policies.
///
/// Policies hold sets of kinds instead of inspecting error types, so every
/// new failure source only has to pick a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused, reset, DNS failure.
    Network,
    /// The source did not answer in time.
    Timeout,
    /// The source itself signalled overload (HTTP 429 and friends).
    Throttled,
    /// The source failed on its side (HTTP 5xx).
    Server,
    /// The request was rejected as invalid (HTTP 4xx other than 429).
    Client,
    /// The payload could not be decoded.
    Parse,
    /// The caller supplied an unusable target or parameter.
    InvalidInput,
    /// The circuit breaker rejected the call.
    CircuitOpen,
    /// Local admission control rejected the call.
    RateLimited,
    /// The caller cancelled the call.
    Cancelled,
    /// The shared window store failed.
    Store,
    /// Invalid configuration.
    Config,
    /// Anything else.
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Throttled => "throttled",
            ErrorKind::Server => "server",
            ErrorKind::Client => "client",
            ErrorKind::Parse => "parse",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Store => "store",
            ErrorKind::Config => "config",
            ErrorKind::Other => "other",
        }
    }

    /// Kinds produced by the protection layer itself. Retrying them would
    /// either spin against a known-closed gate or ignore the caller.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ErrorKind::CircuitOpen | ErrorKind::RateLimited | ErrorKind::Cancelled
        )
    }

    /// Transient source failures: the default retryable and countable set.
    pub fn transient() -> [ErrorKind; 4] {
        [
            ErrorKind::Network,
            ErrorKind::Timeout,
            ErrorKind::Throttled,
            ErrorKind::Server,
        ]
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "network" => Ok(ErrorKind::Network),
            "timeout" => Ok(ErrorKind::Timeout),
            "throttled" => Ok(ErrorKind::Throttled),
            "server" => Ok(ErrorKind::Server),
            "client" => Ok(ErrorKind::Client),
            "parse" => Ok(ErrorKind::Parse),
            "invalid_input" => Ok(ErrorKind::InvalidInput),
            "circuit_open" => Ok(ErrorKind::CircuitOpen),
            "rate_limited" => Ok(ErrorKind::RateLimited),
            "cancelled" => Ok(ErrorKind::Cancelled),
            "store" => Ok(ErrorKind::Store),
            "config" => Ok(ErrorKind::Config),
            "other" => Ok(ErrorKind::Other),
            _ => Err(format!("Unknown error kind: {s}")),
        }
    }
}

/// Application-wide error types for Bulwark.
#[derive(Error, Debug)]
pub enum AppError {
    /// Admission denied by the sliding-window rate limiter.
    #[error("Rate limit exceeded for '{key}', retry after {:.1}s", .retry_after.as_secs_f64())]
    RateLimitExceeded { key: String, retry_after: Duration },

    /// Circuit breaker rejected the call without invoking the source.
    #[error("Circuit breaker '{name}' is open, retry after {}s", .retry_after.as_secs())]
    CircuitOpen { name: String, retry_after: Duration },

    /// Failure reported by the data source (fetch, decode, transport).
    #[error("{kind} error: {message}")]
    Source { kind: ErrorKind, message: String },

    /// The caller cancelled the call or its deadline passed.
    #[error("Collection cancelled")]
    Cancelled,

    /// Shared rate-limit store failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Build a source failure of the given kind.
    pub fn upstream(kind: ErrorKind, message: impl Into<String>) -> Self {
        AppError::Source {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::upstream(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::upstream(ErrorKind::Timeout, message)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::RateLimitExceeded { .. } => ErrorKind::RateLimited,
            AppError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            AppError::Source { kind, .. } => *kind,
            AppError::Cancelled => ErrorKind::Cancelled,
            AppError::Store(_) => ErrorKind::Store,
            AppError::Config(_) => ErrorKind::Config,
            AppError::Serialization(_) => ErrorKind::Parse,
        }
    }
}
