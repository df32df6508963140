pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod models;
pub mod rate_limit;
pub mod retry;
pub mod traits;

#[cfg(test)]
mod testutil;

pub use cache::ResultCache;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use config::CollectorSettings;
pub use error::{AppError, ErrorKind};
pub use events::{
    BroadcastEventSink, CollectionEvent, EventContext, EventKind, EventSink, NoopEventSink,
    TracingEventSink,
};
pub use executor::{ExecutorStatus, ProtectedExecutor};
pub use models::{CollectionResult, CollectorStats, HealthReport, HealthState, Payload, compute_hash};
pub use rate_limit::{InMemoryWindowStore, RateLimitConfig, RateLimitInfo, RateLimiter, WindowStatus};
pub use retry::{RetryConfig, RetryHandler, RetryStrategy};
pub use traits::{Collector, Params, WindowAdmission, WindowRequest, WindowStore, WindowTally};
