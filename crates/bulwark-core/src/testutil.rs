//! Test utilities: handwritten mocks for the core traits.
//!
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use crate::error::{AppError, ErrorKind};
use crate::events::{CollectionEvent, EventSink};
use crate::models::{HealthReport, Payload};
use crate::traits::{Collector, Params, WindowAdmission, WindowRequest, WindowStore, WindowTally};

// ---------------------------------------------------------------------------
// MockCollector
// ---------------------------------------------------------------------------

/// Collector with scripted responses.
#[derive(Clone)]
pub struct MockCollector {
    name: String,
    /// Queue of responses. Each call pops the first element.
    /// If empty, falls back to `fallback`.
    responses: Arc<Mutex<Vec<Result<Payload, AppError>>>>,
    /// Kind of the error returned once the queue is drained; `None` means
    /// a one-item success.
    fallback: Option<ErrorKind>,
    delay: Option<Duration>,
    calls: Arc<AtomicU32>,
    valid: bool,
    panics: bool,
}

impl MockCollector {
    /// Always succeeds with a single item.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            responses: Arc::new(Mutex::new(Vec::new())),
            fallback: None,
            delay: None,
            calls: Arc::new(AtomicU32::new(0)),
            valid: true,
            panics: false,
        }
    }

    /// Always fails with an error of `kind`.
    pub fn failing(name: &str, kind: ErrorKind) -> Self {
        Self {
            fallback: Some(kind),
            ..Self::new(name)
        }
    }

    pub fn with_responses(name: &str, responses: Vec<Result<Payload, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Self::new(name)
        }
    }

    /// Sleep this long inside every fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Panic inside every fetch.
    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub fn invalid(mut self) -> Self {
        self.valid = false;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn sample_payload(items: usize, quality_score: f64) -> Payload {
    let data = (0..items).map(|i| json!({ "id": i })).collect();
    Payload::new(data, quality_score)
}

impl Collector for MockCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, target: &str, _params: &Params) -> Result<Payload, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panics {
            panic!("parser blew up on {target}");
        }
        let next = {
            let mut responses = self.responses.lock().unwrap();
            (!responses.is_empty()).then(|| responses.remove(0))
        };
        match (next, self.fallback) {
            (Some(response), _) => response,
            (None, Some(kind)) => Err(AppError::upstream(kind, format!("{target} unavailable"))),
            (None, None) => Ok(sample_payload(1, 100.0)),
        }
    }

    fn validate_config(&self) -> bool {
        self.valid
    }

    async fn health_check(&self) -> HealthReport {
        match self.fallback {
            Some(kind) => HealthReport::unhealthy(format!("{kind} error")),
            None => HealthReport::healthy().with_detail("collector", self.name.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

/// Event sink that records every published event.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<CollectionEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CollectionEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_types(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.event_type()).collect()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: CollectionEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ---------------------------------------------------------------------------
// UnreachableStore
// ---------------------------------------------------------------------------

/// Window store whose backend is always down.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnreachableStore;

impl WindowStore for UnreachableStore {
    async fn admit(&self, _request: &WindowRequest<'_>) -> Result<WindowAdmission, AppError> {
        Err(AppError::Store("connection refused".into()))
    }

    async fn tally(&self, _key: &str, _now: f64, _window: u64) -> Result<WindowTally, AppError> {
        Err(AppError::Store("connection refused".into()))
    }

    async fn clear(&self, _key: &str) -> Result<(), AppError> {
        Err(AppError::Store("connection refused".into()))
    }
}
