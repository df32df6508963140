//! Protected collection: the single call path every collector goes through.
//!
//! Per call: emit `collection_started`, consult the optional result cache,
//! charge the rate limiter once, then run the fetch inside the retry loop
//! with each attempt wrapped by the circuit breaker. Every outcome, including
//! rejection and cancellation, comes back as a [`CollectionResult`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::ResultCache;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerStats};
use crate::config::CollectorSettings;
use crate::error::{AppError, ErrorKind};
use crate::events::{CollectionEvent, EventContext, EventSink, TracingEventSink};
use crate::models::{CollectionResult, CollectorStats, HealthReport};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::retry::{RetryHandler, RetryStats};
use crate::traits::{Collector, Params, WindowStore};

/// Turn a panic raised inside `fetch` into an ordinary collector error.
fn panic_error(panic: Box<dyn Any + Send>) -> AppError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!(%message, "Collector panicked during fetch");
    AppError::upstream(ErrorKind::Other, format!("collector panicked: {message}"))
}

/// Snapshot of an executor's protections and running totals.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStatus {
    pub collector: String,
    pub circuit_breaker: CircuitBreakerStats,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryStats,
    pub stats: CollectorStats,
    pub cache_entries: Option<u64>,
}

/// Wraps one collector with its own rate limiter, circuit breaker and retry
/// handler.
pub struct ProtectedExecutor<C, S, E = TracingEventSink>
where
    C: Collector,
    S: WindowStore,
    E: EventSink,
{
    collector: C,
    limiter: RateLimiter<S>,
    breaker: CircuitBreaker,
    retry: RetryHandler,
    events: E,
    stats: Mutex<CollectorStats>,
    cache: Option<ResultCache>,
}

impl<C, S, E> ProtectedExecutor<C, S, E>
where
    C: Collector,
    S: WindowStore,
    E: EventSink,
{
    pub fn new(
        collector: C,
        limiter: RateLimiter<S>,
        breaker: CircuitBreaker,
        retry: RetryHandler,
        events: E,
    ) -> Self {
        Self {
            collector,
            limiter,
            breaker,
            retry,
            events,
            stats: Mutex::new(CollectorStats::default()),
            cache: None,
        }
    }

    /// Build every protection from settings. The breaker is named after the
    /// collector.
    pub fn from_settings(
        collector: C,
        store: S,
        settings: &CollectorSettings,
        events: E,
    ) -> Result<Self, AppError> {
        settings.validate()?;
        let breaker = CircuitBreaker::new(
            collector.name().to_string(),
            settings.circuit_breaker.to_config()?,
        );
        let limiter = RateLimiter::new(store, settings.rate_limit.clone());
        let retry = RetryHandler::new(settings.retry.to_config()?);
        let cache = settings.cache.as_ref().map(ResultCache::from_settings);

        let executor = Self::new(collector, limiter, breaker, retry, events);
        Ok(match cache {
            Some(cache) => executor.with_cache(cache),
            None => executor,
        })
    }

    /// Serve repeated calls from `cache` until their entries expire.
    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn collector(&self) -> &C {
        &self.collector
    }

    pub fn limiter(&self) -> &RateLimiter<S> {
        &self.limiter
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry_handler(&self) -> &RetryHandler {
        &self.retry
    }

    fn lock_stats(&self) -> MutexGuard<'_, CollectorStats> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn stats(&self) -> CollectorStats {
        self.lock_stats().clone()
    }

    pub fn status(&self) -> ExecutorStatus {
        ExecutorStatus {
            collector: self.collector.name().to_string(),
            circuit_breaker: self.breaker.stats(),
            rate_limit: self.limiter.config().clone(),
            retry: self.retry.stats(),
            stats: self.stats(),
            cache_entries: self.cache.as_ref().map(ResultCache::len),
        }
    }

    /// Rate-limit key for a target of this collector.
    pub fn rate_limit_key(&self, target: &str) -> String {
        format!("{}:{}", self.collector.name(), target)
    }

    pub fn validate_config(&self) -> bool {
        self.collector.validate_config()
    }

    /// Collector health, annotated with the breaker state.
    pub async fn health_check(&self) -> HealthReport {
        self.collector
            .health_check()
            .await
            .with_detail("circuit_state", self.breaker.state().to_string())
    }

    /// Collect `target` with every protection applied. Never fails: errors
    /// are reported in the returned result.
    pub async fn collect_with_protection(&self, target: &str, params: &Params) -> CollectionResult {
        self.collect_with_cancel(target, params, &CancellationToken::new())
            .await
    }

    /// Like [`collect_with_protection`](Self::collect_with_protection), but
    /// `cancel` aborts the call mid-fetch or mid-backoff.
    pub async fn collect_with_cancel(
        &self,
        target: &str,
        params: &Params,
        cancel: &CancellationToken,
    ) -> CollectionResult {
        let started = Instant::now();
        let name = self.collector.name();
        let context = EventContext::new(name, target);
        self.events.publish(CollectionEvent::started(&context));

        let cache_key = self
            .cache
            .as_ref()
            .map(|_| ResultCache::key(name, target, params));
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key)
            && let Some(mut hit) = cache.get(key).await
        {
            hit.cache_hit = true;
            hit.execution_time = started.elapsed().as_secs_f64();
            hit.metadata.insert(
                "correlation_id".into(),
                Value::String(context.correlation_id.to_string()),
            );
            self.lock_stats().record_cache_hit();
            tracing::debug!(
                correlation_id = %context.correlation_id,
                collector = %name,
                %target,
                "Cache hit"
            );
            self.events.publish(CollectionEvent::completed(
                &context,
                hit.quality_score,
                hit.data.len(),
            ));
            return hit;
        }

        let key = self.rate_limit_key(target);
        let (allowed, info) = self
            .limiter
            .admit(&key, self.limiter.config().cost_per_request)
            .await;
        if !allowed {
            let retry_after = info
                .retry_after
                .unwrap_or(self.limiter.config().window_seconds as f64);
            self.events.publish(CollectionEvent::rate_limit_exceeded(
                &context,
                retry_after,
                info.current_score,
                info.limit,
            ));
            let error = AppError::RateLimitExceeded {
                key,
                retry_after: Duration::try_from_secs_f64(retry_after).unwrap_or_default(),
            };
            return self.fail(&context, &error, started, 0);
        }

        let outcome = self
            .retry
            .run(
                || {
                    self.breaker.call(|| {
                        AssertUnwindSafe(self.collector.fetch(target, params))
                            .catch_unwind()
                            .map(|outcome| outcome.unwrap_or_else(|panic| Err(panic_error(panic))))
                    })
                },
                cancel,
            )
            .await;
        let retries = outcome.retries();

        match outcome.result {
            Ok(payload) => {
                let elapsed = started.elapsed();
                let mut result = CollectionResult::from_payload(name, payload);
                result.execution_time = elapsed.as_secs_f64();
                result.retry_count = retries;
                result.metadata.insert(
                    "correlation_id".into(),
                    Value::String(context.correlation_id.to_string()),
                );

                self.lock_stats().record_success(elapsed);
                if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
                    cache.insert(key, result.clone()).await;
                }
                self.events.publish(CollectionEvent::completed(
                    &context,
                    result.quality_score,
                    result.data.len(),
                ));
                result
            }
            Err(error) => self.fail(&context, &error, started, retries),
        }
    }

    /// Degraded-result path shared by every terminal failure.
    fn fail(
        &self,
        context: &EventContext,
        error: &AppError,
        started: Instant,
        retries: u32,
    ) -> CollectionResult {
        let elapsed = started.elapsed();
        let mut result = CollectionResult::degraded(self.collector.name(), error.to_string());
        result.execution_time = elapsed.as_secs_f64();
        result.retry_count = retries;
        result.metadata.insert(
            "correlation_id".into(),
            Value::String(context.correlation_id.to_string()),
        );
        result
            .metadata
            .insert("error_kind".into(), Value::String(error.kind().to_string()));

        self.lock_stats().record_failure(elapsed);
        self.events.publish(CollectionEvent::failed(
            context,
            error.to_string(),
            result.execution_time,
        ));
        result
    }
}
