//! Circuit breaker for per-collector failure isolation.
//!
//! Stops calling a failing source for a cooldown period, then lets a bounded
//! number of probes through to test whether it recovered.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[timeout]--> HALF_OPEN (probing)
//!                                                                         |
//!                                       <--[failure]--                    |
//!                                                                         |
//! CLOSED <-----------------------[M successes]----------------------------+
//! ```
//!
//! All bookkeeping for one breaker happens under a single mutex, so a
//! failure and the transition it triggers are one atomic step relative to
//! other calls on the same breaker.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{AppError, ErrorKind};

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - requests are rejected immediately.
    Open,
    /// Circuit is half-open - limited requests allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive qualifying failures before opening the circuit.
    pub failure_threshold: u32,

    /// Number of successful probes in half-open state to close the circuit.
    /// Also caps the number of probes in flight at once.
    pub success_threshold: u32,

    /// Time to wait after the last failure before transitioning Open to Half-Open.
    pub recovery_timeout: Duration,

    /// Error kinds that count as failures. Anything else passes through
    /// without touching the counters.
    pub countable: HashSet<ErrorKind>,

    /// When the source throttles us (`ErrorKind::Throttled`) while tripping,
    /// multiply the recovery timeout by this factor. 1.0 disables.
    pub throttle_backoff_multiplier: f32,

    /// Upper bound for the extended recovery timeout.
    pub max_recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            countable: ErrorKind::transient().into_iter().collect(),
            throttle_backoff_multiplier: 1.0,
            max_recovery_timeout: Duration::from_secs(600),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.failure_threshold == 0 {
            return Err(AppError::Config(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.success_threshold == 0 {
            return Err(AppError::Config(
                "circuit_breaker.success_threshold must be at least 1".into(),
            ));
        }
        let multiplier = self.throttle_backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(AppError::Config(
                "circuit_breaker.throttle_backoff_multiplier must be a finite number >= 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Internal state tracking for the circuit breaker.
#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    last_state_change: Instant,
    last_error_message: Option<String>,
    current_recovery_timeout: Duration,
    /// Probes currently running in the half-open state.
    half_open_in_flight: u32,
    /// Bumped on every transition. Outcomes and probe permits from an older
    /// epoch only touch the totals.
    generation: u64,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
}

impl CircuitBreakerInner {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_state_change: Instant::now(),
            last_error_message: None,
            current_recovery_timeout: config.recovery_timeout,
            half_open_in_flight: 0,
            generation: 0,
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
        }
    }

    fn remaining_cooldown(&self) -> Duration {
        self.last_failure_time
            .map(|t| self.current_recovery_timeout.saturating_sub(t.elapsed()))
            .unwrap_or(self.current_recovery_timeout)
    }
}

/// Statistics about circuit breaker state for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Percentage of executed requests that failed with a countable error.
    pub failure_rate: f64,
    pub last_error: Option<String>,
    pub since_last_failure: Option<Duration>,
    /// Time spent in the current state.
    pub time_in_state: Duration,
    pub time_until_half_open: Option<Duration>,
    pub half_open_in_flight: u32,
}

/// A call let through by [`CircuitBreaker::admit`], tied to the epoch it
/// was admitted in.
struct Admission {
    generation: u64,
    _probe: Option<ProbePermit>,
}

/// Releases a half-open probe slot when the probe finishes or is dropped.
struct ProbePermit {
    inner: Arc<Mutex<CircuitBreakerInner>>,
    generation: u64,
}

impl Drop for ProbePermit {
    fn drop(&mut self) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if inner.generation == self.generation && inner.half_open_in_flight > 0 {
            inner.half_open_in_flight -= 1;
        }
    }
}

/// Thread-safe circuit breaker, shared by every concurrent call to one collector.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = CircuitBreakerInner::new(&config);
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        let time_until_half_open =
            (inner.state == CircuitState::Open).then(|| inner.remaining_cooldown());
        let failure_rate = if inner.total_requests > 0 {
            inner.total_failures as f64 / inner.total_requests as f64 * 100.0
        } else {
            0.0
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_requests: inner.total_requests,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            failure_rate,
            last_error: inner.last_error_message.clone(),
            since_last_failure: inner.last_failure_time.map(|t| t.elapsed()),
            time_in_state: inner.last_state_change.elapsed(),
            time_until_half_open,
            half_open_in_flight: inner.half_open_in_flight,
        }
    }

    /// Executes the given operation through the circuit breaker.
    ///
    /// - Closed: executes operation, tracks success/failure
    /// - Open: returns `AppError::CircuitOpen` without executing
    /// - HalfOpen: executes as a probe if a probe slot is free, transitions
    ///   based on the result
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let admission = self.admit()?;

        let result = operation().await;

        match &result {
            Ok(_) => self.on_success(Some(admission.generation)),
            Err(e) if self.config.countable.contains(&e.kind()) => {
                self.on_failure(e, Some(admission.generation))
            }
            Err(e) => {
                tracing::debug!(
                    circuit = %self.name,
                    kind = %e.kind(),
                    "Error not counted by circuit breaker"
                );
            }
        }

        result
    }

    /// Decide whether a call may run. Half-open admissions hold a probe slot.
    fn admit(&self) -> Result<Admission, AppError> {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => {
                inner.total_requests += 1;
                Ok(Admission {
                    generation: inner.generation,
                    _probe: None,
                })
            }
            CircuitState::Open => Err(AppError::CircuitOpen {
                name: self.name.clone(),
                retry_after: inner.remaining_cooldown(),
            }),
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.success_threshold {
                    tracing::debug!(
                        circuit = %self.name,
                        in_flight = inner.half_open_in_flight,
                        "Half-open probe limit reached, rejecting call"
                    );
                    return Err(AppError::CircuitOpen {
                        name: self.name.clone(),
                        retry_after: Duration::ZERO,
                    });
                }
                inner.half_open_in_flight += 1;
                inner.total_requests += 1;
                Ok(Admission {
                    generation: inner.generation,
                    _probe: Some(ProbePermit {
                        inner: Arc::clone(&self.inner),
                        generation: inner.generation,
                    }),
                })
            }
        }
    }

    /// Record a success against the current state.
    pub fn record_success(&self) {
        self.on_success(None);
    }

    /// Record a failure against the current state.
    pub fn record_failure(&self, error: &AppError) {
        self.on_failure(error, None);
    }

    fn is_stale(&self, inner: &CircuitBreakerInner, generation: Option<u64>) -> bool {
        let stale = generation.is_some_and(|g| g != inner.generation);
        if stale {
            tracing::debug!(
                circuit = %self.name,
                state = %inner.state,
                "Ignoring outcome of a call admitted before the last state change"
            );
        }
        stale
    }

    fn on_success(&self, generation: Option<u64>) {
        let mut inner = self.lock_inner();
        inner.total_successes += 1;
        if self.is_stale(&inner, generation) {
            return;
        }

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    tracing::info!(
                        circuit = %self.name,
                        "Circuit breaker closing after {} successful probes",
                        inner.success_count
                    );
                    self.transition(&mut inner, CircuitState::Closed);
                    inner.last_error_message = None;
                    inner.current_recovery_timeout = self.config.recovery_timeout;
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, error: &AppError, generation: Option<u64>) {
        let mut inner = self.lock_inner();
        let is_throttled = error.kind() == ErrorKind::Throttled;

        inner.total_failures += 1;
        if self.is_stale(&inner, generation) {
            return;
        }
        inner.last_error_message = Some(error.to_string());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.last_failure_time = Some(Instant::now());

                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        error = %error,
                        "Circuit breaker opening after {} consecutive failures",
                        inner.failure_count
                    );
                    self.transition(&mut inner, CircuitState::Open);
                    if is_throttled {
                        self.extend_recovery_timeout(&mut inner);
                    }
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    circuit = %self.name,
                    error = %error,
                    "Circuit breaker probe failed, returning to open state"
                );
                inner.failure_count += 1;
                inner.last_failure_time = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
                if is_throttled {
                    self.extend_recovery_timeout(&mut inner);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Administrative override: close the circuit and clear all counters.
    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        self.transition(&mut inner, CircuitState::Closed);
        inner.last_failure_time = None;
        inner.last_error_message = None;
        inner.current_recovery_timeout = self.config.recovery_timeout;
    }

    /// Administrative override: open the circuit for a full recovery timeout.
    pub fn force_open(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually forced open");
        inner.last_failure_time = Some(Instant::now());
        self.transition(&mut inner, CircuitState::Open);
    }

    fn extend_recovery_timeout(&self, inner: &mut CircuitBreakerInner) {
        if self.config.throttle_backoff_multiplier <= 1.0 {
            return;
        }
        let extended = Duration::try_from_secs_f32(
            inner.current_recovery_timeout.as_secs_f32() * self.config.throttle_backoff_multiplier,
        )
        .unwrap_or(self.config.max_recovery_timeout);
        // Never shorter than the configured cooldown, even when the cap is below it.
        inner.current_recovery_timeout = extended
            .min(self.config.max_recovery_timeout)
            .max(self.config.recovery_timeout);
        tracing::info!(
            circuit = %self.name,
            recovery_timeout_secs = inner.current_recovery_timeout.as_secs(),
            "Extended recovery timeout due to upstream throttling"
        );
    }

    fn transition(&self, inner: &mut CircuitBreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.last_state_change = Instant::now();
        inner.generation += 1;
        inner.half_open_in_flight = 0;
        match to {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
            }
            CircuitState::HalfOpen => inner.success_count = 0,
            CircuitState::Open => {}
        }
        tracing::debug!(circuit = %self.name, %from, %to, "Circuit breaker state change");
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(last_failure) = inner.last_failure_time
            && last_failure.elapsed() >= inner.current_recovery_timeout
        {
            tracing::info!(
                circuit = %self.name,
                "Circuit breaker transitioning to half-open state"
            );
            self.transition(inner, CircuitState::HalfOpen);
        }
    }
}
