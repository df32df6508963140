use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Fields shared by every lifecycle event of one collection call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    pub correlation_id: Uuid,
    pub collector_name: String,
    pub target: String,
    pub timestamp: DateTime<Utc>,
}

impl EventContext {
    pub fn new(collector_name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            collector_name: collector_name.into(),
            target: target.into(),
            timestamp: Utc::now(),
        }
    }

    /// Same call, fresh timestamp.
    fn touch(&self) -> Self {
        Self {
            timestamp: Utc::now(),
            ..self.clone()
        }
    }
}

/// What happened, with the fields specific to that event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventKind {
    CollectionStarted,
    RateLimitExceeded {
        /// Seconds until budget frees up.
        retry_after: f64,
        current_score: u64,
        limit: u64,
    },
    CollectionCompleted {
        quality_score: f64,
        data_count: usize,
    },
    CollectionFailed {
        error: String,
        execution_time: f64,
    },
}

/// Lifecycle event emitted by the protected executor. Serializes flat:
/// context fields, `event_type`, then the kind-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionEvent {
    #[serde(flatten)]
    pub context: EventContext,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl CollectionEvent {
    fn new(context: &EventContext, kind: EventKind) -> Self {
        Self {
            context: context.touch(),
            kind,
        }
    }

    pub fn started(context: &EventContext) -> Self {
        Self::new(context, EventKind::CollectionStarted)
    }

    pub fn rate_limit_exceeded(
        context: &EventContext,
        retry_after: f64,
        current_score: u64,
        limit: u64,
    ) -> Self {
        Self::new(
            context,
            EventKind::RateLimitExceeded {
                retry_after,
                current_score,
                limit,
            },
        )
    }

    pub fn completed(context: &EventContext, quality_score: f64, data_count: usize) -> Self {
        Self::new(
            context,
            EventKind::CollectionCompleted {
                quality_score,
                data_count,
            },
        )
    }

    pub fn failed(context: &EventContext, error: impl Into<String>, execution_time: f64) -> Self {
        Self::new(
            context,
            EventKind::CollectionFailed {
                error: error.into(),
                execution_time,
            },
        )
    }

    pub fn event_type(&self) -> &'static str {
        match self.kind {
            EventKind::CollectionStarted => "collection_started",
            EventKind::RateLimitExceeded { .. } => "rate_limit_exceeded",
            EventKind::CollectionCompleted { .. } => "collection_completed",
            EventKind::CollectionFailed { .. } => "collection_failed",
        }
    }
}

/// Receiver of collection lifecycle events (decoupled event bus).
///
/// Publishing is fire-and-forget: a sink must not block the call path and
/// its failures never reach the caller.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: CollectionEvent) {
        let _ = event;
    }
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {}

/// Sink that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: CollectionEvent) {
        let CollectionEvent { context, kind } = &event;
        let correlation_id = &context.correlation_id;
        let collector = &context.collector_name;
        let target = &context.target;
        match kind {
            EventKind::CollectionStarted => {
                tracing::info!(%correlation_id, %collector, %target, "Collection started");
            }
            EventKind::RateLimitExceeded {
                retry_after,
                current_score,
                limit,
            } => {
                tracing::warn!(
                    %correlation_id,
                    %collector,
                    %target,
                    retry_after,
                    current_score,
                    limit,
                    "Collection rate limited"
                );
            }
            EventKind::CollectionCompleted {
                quality_score,
                data_count,
            } => {
                tracing::info!(
                    %correlation_id,
                    %collector,
                    %target,
                    quality_score,
                    data_count,
                    "Collection completed"
                );
            }
            EventKind::CollectionFailed {
                error,
                execution_time,
            } => {
                tracing::warn!(
                    %correlation_id,
                    %collector,
                    %target,
                    %error,
                    execution_time,
                    "Collection failed"
                );
            }
        }
    }
}

/// Fans events out to any number of in-process subscribers.
///
/// Slow subscribers lag and lose the oldest events; with no subscribers the
/// event is dropped.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<CollectionEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollectionEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event: CollectionEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("No event subscribers");
        }
    }
}

impl<T: EventSink + ?Sized> EventSink for std::sync::Arc<T> {
    fn publish(&self, event: CollectionEvent) {
        (**self).publish(event);
    }
}
