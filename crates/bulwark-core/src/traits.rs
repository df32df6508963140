use std::collections::BTreeMap;
use std::future::Future;

use crate::error::AppError;
use crate::models::{HealthReport, Payload};

/// Extra request parameters for a collection call. Ordered so that the
/// same parameters always produce the same cache key.
pub type Params = BTreeMap<String, String>;

/// Capability set a concrete data source supplies to the executor.
///
/// The executor never looks past these three operations; transport, parsing
/// and quality scoring stay inside the collector.
pub trait Collector: Send + Sync {
    /// Stable source name, used for breaker naming, rate-limit keys and events.
    fn name(&self) -> &str;

    /// Fetch and shape data for `target`. This is the protected operation.
    fn fetch(
        &self,
        target: &str,
        params: &Params,
    ) -> impl Future<Output = Result<Payload, AppError>> + Send;

    /// Check that the collector's own configuration is usable.
    fn validate_config(&self) -> bool;

    /// Probe the upstream source without going through the protections.
    fn health_check(&self) -> impl Future<Output = HealthReport> + Send;
}

/// Totals for the live entries of one sliding window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowTally {
    /// Number of live entries.
    pub count: u64,
    /// Sum of live entry costs.
    pub score: u64,
    /// Timestamp (unix seconds) of the oldest live entry.
    pub oldest: Option<f64>,
}

/// One sliding-window admission request.
#[derive(Debug, Clone)]
pub struct WindowRequest<'a> {
    pub key: &'a str,
    /// Current time, unix seconds.
    pub now: f64,
    pub window_seconds: u64,
    pub limit: u64,
    pub cost: u64,
    /// Idle expiry for the whole key, seconds.
    pub ttl_seconds: u64,
}

/// Result of an admission attempt. `tally` is measured after the entry was
/// added when `allowed`, before otherwise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowAdmission {
    pub allowed: bool,
    pub tally: WindowTally,
}

/// External atomic key-value store holding rate-limit windows.
///
/// `admit` must trim expired entries, sum the remaining costs, compare
/// against the limit and insert the new entry as one atomic step per key.
/// Splitting it into read-then-write calls allows over-admission.
pub trait WindowStore: Send + Sync + Clone {
    fn admit(
        &self,
        request: &WindowRequest<'_>,
    ) -> impl Future<Output = Result<WindowAdmission, AppError>> + Send;

    /// Tally live entries without mutating the window.
    fn tally(
        &self,
        key: &str,
        now: f64,
        window_seconds: u64,
    ) -> impl Future<Output = Result<WindowTally, AppError>> + Send;

    /// Drop the whole window for `key`.
    fn clear(&self, key: &str) -> impl Future<Output = Result<(), AppError>> + Send;
}
