//! Bounded retry loop with configurable backoff and jitter.
//!
//! Only errors whose [`ErrorKind`] is in the configured retryable set are
//! retried; anything else is returned on first occurrence. Backoff sleeps are
//! non-blocking and can be cut short with a [`CancellationToken`].

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, ErrorKind};

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// `base_delay * backoff_factor^(attempt - 1)`
    Exponential,
    /// `base_delay * attempt`
    Linear,
    /// `base_delay`
    Constant,
    /// `base_delay * fib(attempt)`
    Fibonacci,
}

impl RetryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStrategy::Exponential => "exponential",
            RetryStrategy::Linear => "linear",
            RetryStrategy::Constant => "constant",
            RetryStrategy::Fibonacci => "fibonacci",
        }
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RetryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exponential" => Ok(RetryStrategy::Exponential),
            "linear" => Ok(RetryStrategy::Linear),
            "constant" => Ok(RetryStrategy::Constant),
            "fibonacci" => Ok(RetryStrategy::Fibonacci),
            _ => Err(format!("Unknown retry strategy: {s}")),
        }
    }
}

/// Telemetry hook invoked before each backoff sleep with
/// `(attempt, error, delay)`.
pub type RetryObserver = Arc<dyn Fn(u32, &AppError, Duration) + Send + Sync>;

/// Retry configuration.
#[derive(Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one. At least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: RetryStrategy,
    /// Multiply each delay by a uniform factor in [0.8, 1.2].
    pub jitter: bool,
    pub backoff_factor: f64,
    pub retryable: HashSet<ErrorKind>,
    pub on_retry: Option<RetryObserver>,
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("strategy", &self.strategy)
            .field("jitter", &self.jitter)
            .field("backoff_factor", &self.backoff_factor)
            .field("retryable", &self.retryable)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: RetryStrategy::Exponential,
            jitter: true,
            backoff_factor: 2.0,
            retryable: ErrorKind::transient().into_iter().collect(),
            on_retry: None,
        }
    }
}

impl RetryConfig {
    /// Preset for JSON API calls.
    pub fn api_call() -> Self {
        Self {
            max_delay: Duration::from_secs(30),
            ..Default::default()
        }
    }

    /// Preset for scraping HTML sources, which tolerate slower retries.
    pub fn web_scraping() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            ..Default::default()
        }
    }

    pub fn with_observer(mut self, observer: RetryObserver) -> Self {
        self.on_retry = Some(observer);
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_attempts == 0 {
            return Err(AppError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.base_delay > self.max_delay {
            return Err(AppError::Config(
                "retry.base_delay must not exceed retry.max_delay".into(),
            ));
        }
        if !self.backoff_factor.is_finite() {
            return Err(AppError::Config("retry.backoff_factor must be finite".into()));
        }
        if self.strategy == RetryStrategy::Exponential && self.backoff_factor < 1.0 {
            return Err(AppError::Config(
                "retry.backoff_factor must be >= 1.0 for exponential backoff".into(),
            ));
        }
        Ok(())
    }

    /// Delay before the attempt following `attempt` (1-indexed), jitter
    /// excluded, clamped to `max_delay`.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        clamp_secs(self.raw_delay_secs(attempt), self.max_delay)
    }

    fn raw_delay_secs(&self, attempt: u32) -> f64 {
        let base = self.base_delay.as_secs_f64();
        match self.strategy {
            RetryStrategy::Exponential => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                base * self.backoff_factor.powi(exponent)
            }
            RetryStrategy::Linear => base * f64::from(attempt),
            RetryStrategy::Constant => base,
            RetryStrategy::Fibonacci => base * fibonacci(attempt),
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut secs = self.raw_delay_secs(attempt);
        if self.jitter {
            secs *= rand::rng().random_range(0.8_f64..=1.2);
        }
        clamp_secs(secs, self.max_delay)
    }
}

fn clamp_secs(secs: f64, max: Duration) -> Duration {
    if !secs.is_finite() || secs >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// n-th Fibonacci number with fib(1) = fib(2) = 1, computed iteratively.
fn fibonacci(n: u32) -> f64 {
    let (mut a, mut b) = (0.0_f64, 1.0_f64);
    for _ in 0..n {
        (a, b) = (b, a + b);
        if a.is_infinite() {
            break;
        }
    }
    a
}

/// Outcome of a retry loop: the final result and how many times the
/// operation was invoked.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, AppError>,
    pub attempts: u32,
}

impl<T> RetryOutcome<T> {
    /// Attempts beyond the first.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Summary of a handler's configuration for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RetryStats {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: RetryStrategy,
    pub jitter: bool,
    pub backoff_factor: f64,
    pub retryable: Vec<ErrorKind>,
}

/// Executes operations with retries according to a [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryHandler {
    config: RetryConfig,
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn is_retryable(&self, error: &AppError) -> bool {
        let kind = error.kind();
        !kind.is_terminal() && self.config.retryable.contains(&kind)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or exhausts `max_attempts`. Returns the last error on failure.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.run(operation, &CancellationToken::new()).await.result
    }

    /// Like [`execute`](Self::execute), but aborts with `AppError::Cancelled`
    /// as soon as `cancel` fires, whether mid-operation or mid-backoff.
    pub async fn execute_until<F, Fut, T>(
        &self,
        operation: F,
        cancel: &CancellationToken,
    ) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.run(operation, cancel).await.result
    }

    /// Full retry loop, reporting the attempt count alongside the result.
    pub async fn run<F, Fut, T>(&self, mut operation: F, cancel: &CancellationToken) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(AppError::Cancelled),
                result = operation() => result,
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "Operation succeeded on retry");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(e) => e,
            };

            if !self.is_retryable(&error) {
                tracing::warn!(
                    attempt,
                    kind = %error.kind(),
                    error = %error,
                    "Non-retryable error, not retrying"
                );
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                };
            }

            if attempt >= max_attempts {
                tracing::error!(
                    max_attempts,
                    error = %error,
                    "Max retries exhausted"
                );
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                };
            }

            let delay = self.config.delay_for_attempt(attempt);
            tracing::warn!(
                attempt,
                max_attempts,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "Operation failed, retrying"
            );
            self.notify(attempt, &error, delay);

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::info!(attempt, "Retry backoff cancelled");
                    return RetryOutcome {
                        result: Err(AppError::Cancelled),
                        attempts: attempt,
                    };
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn notify(&self, attempt: u32, error: &AppError, delay: Duration) {
        let Some(observer) = &self.config.on_retry else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| observer(attempt, error, delay))).is_err() {
            tracing::error!(attempt, "Retry observer panicked; continuing");
        }
    }

    pub fn stats(&self) -> RetryStats {
        let mut retryable: Vec<_> = self.config.retryable.iter().copied().collect();
        retryable.sort_by_key(|k| k.as_str());
        RetryStats {
            max_attempts: self.config.max_attempts,
            base_delay: self.config.base_delay,
            max_delay: self.config.max_delay,
            strategy: self.config.strategy,
            jitter: self.config.jitter,
            backoff_factor: self.config.backoff_factor,
            retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    fn no_jitter(strategy: RetryStrategy) -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy,
            jitter: false,
            backoff_factor: 2.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_delay_schedules() {
        let exp = no_jitter(RetryStrategy::Exponential);
        assert_eq!(exp.base_delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(exp.base_delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(exp.base_delay_for_attempt(3), Duration::from_secs(4));

        let lin = no_jitter(RetryStrategy::Linear);
        assert_eq!(lin.base_delay_for_attempt(3), Duration::from_secs(3));

        let constant = no_jitter(RetryStrategy::Constant);
        assert_eq!(constant.base_delay_for_attempt(7), Duration::from_secs(1));

        let fib = no_jitter(RetryStrategy::Fibonacci);
        let secs: Vec<u64> = (1..=6)
            .map(|a| fib.base_delay_for_attempt(a).as_secs())
            .collect();
        assert_eq!(secs, vec![1, 1, 2, 3, 5, 8]);
    }

    #[test]
    fn test_delay_clamped_to_max() {
        let config = RetryConfig {
            max_delay: Duration::from_secs(10),
            ..no_jitter(RetryStrategy::Exponential)
        };
        assert_eq!(config.base_delay_for_attempt(10), Duration::from_secs(10));
        assert_eq!(config.base_delay_for_attempt(5000), Duration::from_secs(10));

        let fib = RetryConfig {
            max_delay: Duration::from_secs(10),
            ..no_jitter(RetryStrategy::Fibonacci)
        };
        assert_eq!(fib.base_delay_for_attempt(100_000), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_bounds() {
        let config = RetryConfig {
            jitter: true,
            base_delay: Duration::from_secs(10),
            ..no_jitter(RetryStrategy::Constant)
        };
        for _ in 0..200 {
            let d = config.delay_for_attempt(1);
            assert!(d >= Duration::from_secs(8), "{d:?}");
            assert!(d <= Duration::from_secs(12), "{d:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_timing() {
        let handler = RetryHandler::new(no_jitter(RetryStrategy::Exponential));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let outcome = handler
            .run(
                || {
                    calls.lock().unwrap().push(start.elapsed());
                    async { Err::<(), _>(AppError::timeout("upstream slow")) }
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.retries(), 2);
        assert!(matches!(
            outcome.result,
            Err(AppError::Source { kind: ErrorKind::Timeout, .. })
        ));
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        for (gap, expected) in gaps.iter().zip([1, 2]) {
            let expected = Duration::from_secs(expected);
            assert!(
                *gap >= expected && *gap < expected + Duration::from_millis(5),
                "gap {gap:?}, expected {expected:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_non_retryable_invoked_once() {
        let handler = RetryHandler::new(no_jitter(RetryStrategy::Exponential));
        let invocations = AtomicU32::new(0);

        let result = handler
            .execute(|| {
                invocations.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(AppError::upstream(ErrorKind::Client, "HTTP 400")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_circuit_open_is_never_retried() {
        let config = RetryConfig {
            retryable: [ErrorKind::CircuitOpen, ErrorKind::Network].into_iter().collect(),
            ..no_jitter(RetryStrategy::Constant)
        };
        let handler = RetryHandler::new(config);
        let invocations = AtomicU32::new(0);

        let _ = handler
            .execute(|| {
                invocations.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(AppError::CircuitOpen {
                        name: "insee".into(),
                        retry_after: Duration::from_secs(5),
                    })
                }
            })
            .await;

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let handler = RetryHandler::new(no_jitter(RetryStrategy::Linear));
        let invocations = AtomicU32::new(0);

        let outcome = handler
            .run(
                || {
                    let n = invocations.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(AppError::network("reset"))
                        } else {
                            Ok("payload")
                        }
                    }
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.result.unwrap(), "payload");
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_panic_does_not_abort_loop() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let config = no_jitter(RetryStrategy::Exponential).with_observer(Arc::new(
            move |attempt, _err, delay| {
                recorder.lock().unwrap().push((attempt, delay));
                panic!("observer failure");
            },
        ));
        let handler = RetryHandler::new(config);
        let invocations = AtomicU32::new(0);

        let _ = handler
            .execute(|| {
                invocations.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(AppError::network("reset")) }
            })
            .await;

        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(1, Duration::from_secs(1)), (2, Duration::from_secs(2))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let config = RetryConfig {
            base_delay: Duration::from_secs(30),
            ..no_jitter(RetryStrategy::Constant)
        };
        let handler = RetryHandler::new(config);
        let cancel = CancellationToken::new();
        let invocations = AtomicU32::new(0);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let result = handler
            .execute_until(
                || {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(AppError::network("reset")) }
                },
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(AppError::Cancelled)));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_cancel_during_operation() {
        let handler = RetryHandler::new(no_jitter(RetryStrategy::Constant));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = handler
            .execute_until(|| std::future::pending::<Result<(), AppError>>(), &cancel)
            .await;
        assert!(matches!(result, Err(AppError::Cancelled)));
    }

    #[test]
    fn test_config_validation() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(RetryConfig::web_scraping().validate().is_ok());
        let zero = RetryConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
        let inverted = RetryConfig {
            base_delay: Duration::from_secs(90),
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(inverted.validate().is_err());

        let shrinking = RetryConfig {
            backoff_factor: 0.5,
            ..Default::default()
        };
        assert!(shrinking.validate().is_err());
        let linear = RetryConfig {
            strategy: RetryStrategy::Linear,
            backoff_factor: 0.5,
            ..Default::default()
        };
        assert!(linear.validate().is_ok());
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "Fibonacci".parse::<RetryStrategy>().unwrap(),
            RetryStrategy::Fibonacci
        );
        assert!("quadratic".parse::<RetryStrategy>().is_err());
    }
}
