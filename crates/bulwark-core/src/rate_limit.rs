//! Sliding-window admission control.
//!
//! Each key owns a window of `(timestamp, cost)` entries covering the
//! trailing `window_seconds`. A request is admitted when the live costs plus
//! its own cost stay within `max_requests`. The window lives in a
//! [`WindowStore`] so several processes can share one budget.
//!
//! Rate limiting is best effort: when the store is unreachable the limiter
//! fails open and admits the request.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::traits::{WindowAdmission, WindowRequest, WindowStore, WindowTally};

/// Configuration for a sliding-window rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum total cost admitted per window.
    pub max_requests: u32,
    pub window_seconds: u64,
    /// Informational only; admission is decided by `max_requests`.
    pub burst_size: u32,
    /// Default weight charged for one collection call.
    pub cost_per_request: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_seconds: 60,
            burst_size: 0,
            cost_per_request: 1,
        }
    }
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_requests == 0 {
            return Err(AppError::Config(
                "rate_limit.max_requests must be greater than 0".into(),
            ));
        }
        if self.window_seconds == 0 {
            return Err(AppError::Config(
                "rate_limit.window_seconds must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Details of one admission decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RateLimitInfo {
    pub allowed: bool,
    /// Sum of live costs, including this request when admitted.
    pub current_score: u64,
    pub current_count: u64,
    pub limit: u64,
    pub remaining: u64,
    /// Seconds until enough budget frees up; only set on rejection.
    pub retry_after: Option<f64>,
    /// Seconds until the oldest live entry leaves the window.
    pub reset_after: f64,
    /// Store failure that caused a fail-open admission.
    pub error: Option<String>,
}

/// Read-only view of a key's window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStatus {
    pub key: String,
    pub current_count: u64,
    pub current_score: u64,
    pub limit: u64,
    pub window_seconds: u64,
    pub remaining: u64,
    pub reset_after: f64,
}

/// Current time as fractional unix seconds.
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Sliding-window rate limiter backed by a shared [`WindowStore`].
#[derive(Debug, Clone)]
pub struct RateLimiter<S: WindowStore> {
    config: RateLimitConfig,
    store: S,
}

impl<S: WindowStore> RateLimiter<S> {
    pub fn new(store: S, config: RateLimitConfig) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn reset_after(&self, now: f64, oldest: Option<f64>) -> f64 {
        let window = self.config.window_seconds as f64;
        match oldest {
            Some(oldest) => (window - (now - oldest)).max(0.0),
            None => window,
        }
    }

    /// Try to admit a request of the given cost for `key`.
    pub async fn admit(&self, key: &str, cost: u32) -> (bool, RateLimitInfo) {
        let now = unix_now();
        let limit = u64::from(self.config.max_requests);
        let request = WindowRequest {
            key,
            now,
            window_seconds: self.config.window_seconds,
            limit,
            cost: u64::from(cost),
            ttl_seconds: self.config.window_seconds * 2,
        };

        let WindowAdmission { allowed, tally } = match self.store.admit(&request).await {
            Ok(admission) => admission,
            Err(e) => {
                tracing::error!(%key, error = %e, "Rate limiter store unavailable, failing open");
                return (
                    true,
                    RateLimitInfo {
                        allowed: true,
                        limit,
                        error: Some(e.to_string()),
                        ..Default::default()
                    },
                );
            }
        };

        let reset_after = self.reset_after(now, tally.oldest);
        if !allowed {
            let retry_after = if tally.oldest.is_some() {
                reset_after
            } else {
                self.config.window_seconds as f64
            };
            tracing::warn!(
                %key,
                current_score = tally.score,
                cost,
                limit,
                retry_after,
                "Rate limit exceeded"
            );
            return (
                false,
                RateLimitInfo {
                    allowed: false,
                    current_score: tally.score,
                    current_count: tally.count,
                    limit,
                    remaining: limit.saturating_sub(tally.score),
                    retry_after: Some(retry_after),
                    reset_after,
                    error: None,
                },
            );
        }

        let remaining = limit.saturating_sub(tally.score);
        tracing::debug!(%key, cost, remaining, "Request admitted");
        (
            true,
            RateLimitInfo {
                allowed: true,
                current_score: tally.score,
                current_count: tally.count,
                limit,
                remaining,
                retry_after: None,
                reset_after,
                error: None,
            },
        )
    }

    /// Current window usage for `key`, without recording anything.
    pub async fn get_status(&self, key: &str) -> Result<WindowStatus, AppError> {
        let now = unix_now();
        let tally = self
            .store
            .tally(key, now, self.config.window_seconds)
            .await?;
        let limit = u64::from(self.config.max_requests);
        Ok(WindowStatus {
            key: key.to_string(),
            current_count: tally.count,
            current_score: tally.score,
            limit,
            window_seconds: self.config.window_seconds,
            remaining: limit.saturating_sub(tally.score),
            reset_after: self.reset_after(now, tally.oldest),
        })
    }

    /// Clear the window for `key`. Returns false when the store failed.
    pub async fn reset(&self, key: &str) -> bool {
        match self.store.clear(key).await {
            Ok(()) => {
                tracing::info!(%key, "Rate limit reset");
                true
            }
            Err(e) => {
                tracing::error!(%key, error = %e, "Error resetting rate limit");
                false
            }
        }
    }
}

#[derive(Debug, Default)]
struct LocalWindow {
    entries: VecDeque<(f64, u64)>,
    expires_at: f64,
}

impl LocalWindow {
    fn trim(&mut self, now: f64, window_seconds: u64) {
        let cutoff = now - window_seconds as f64;
        while self.entries.front().is_some_and(|(ts, _)| *ts <= cutoff) {
            self.entries.pop_front();
        }
    }

    fn tally(&self) -> WindowTally {
        WindowTally {
            count: self.entries.len() as u64,
            score: self.entries.iter().map(|(_, cost)| cost).sum(),
            oldest: self.entries.front().map(|(ts, _)| *ts),
        }
    }
}

/// Process-local window store. Each admission runs under one mutex, so it is
/// atomic per key within this process but not shared across processes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWindowStore {
    windows: Arc<Mutex<HashMap<String, LocalWindow>>>,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, LocalWindow>> {
        self.windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl WindowStore for InMemoryWindowStore {
    async fn admit(&self, request: &WindowRequest<'_>) -> Result<WindowAdmission, AppError> {
        let mut windows = self.lock();
        let window = windows.entry(request.key.to_string()).or_default();

        if window.expires_at > 0.0 && request.now >= window.expires_at {
            window.entries.clear();
        }
        window.trim(request.now, request.window_seconds);

        let before = window.tally();
        if before.score + request.cost > request.limit {
            return Ok(WindowAdmission {
                allowed: false,
                tally: before,
            });
        }

        let at = window
            .entries
            .back()
            .map_or(request.now, |(last, _)| last.max(request.now));
        window.entries.push_back((at, request.cost));
        window.expires_at = request.now + request.ttl_seconds as f64;

        Ok(WindowAdmission {
            allowed: true,
            tally: window.tally(),
        })
    }

    async fn tally(&self, key: &str, now: f64, window_seconds: u64) -> Result<WindowTally, AppError> {
        let windows = self.lock();
        let Some(window) = windows.get(key) else {
            return Ok(WindowTally::default());
        };
        let cutoff = now - window_seconds as f64;
        let live = LocalWindow {
            entries: window
                .entries
                .iter()
                .filter(|(ts, _)| *ts > cutoff)
                .copied()
                .collect(),
            expires_at: window.expires_at,
        };
        Ok(live.tally())
    }

    async fn clear(&self, key: &str) -> Result<(), AppError> {
        self.lock().remove(key);
        Ok(())
    }
}
