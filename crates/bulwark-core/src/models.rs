use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Items and metadata produced by one successful fetch.
///
/// Collectors shape their raw response into this; the executor turns it into
/// a [`CollectionResult`] with timing and retry information attached.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Payload {
    pub data: Vec<Value>,
    pub metadata: Map<String, Value>,
    /// Collector-specific quality estimate, 0–100.
    pub quality_score: f64,
    pub warnings: Vec<String>,
}

impl Payload {
    pub fn new(data: Vec<Value>, quality_score: f64) -> Self {
        Self {
            data,
            quality_score,
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Standard result of one protected collection call.
///
/// Always produced, even on failure: a failed call yields empty `data`,
/// non-empty `errors` and a zero `quality_score`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionResult {
    pub source: String,
    pub data: Vec<Value>,
    pub metadata: Map<String, Value>,
    pub quality_score: f64,
    pub collection_timestamp: DateTime<Utc>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Wall time spent in the protected call, in seconds.
    pub execution_time: f64,
    pub cache_hit: bool,
    /// Attempts beyond the first.
    pub retry_count: u32,
}

impl CollectionResult {
    /// Successful result built from a collector payload.
    pub fn from_payload(source: impl Into<String>, payload: Payload) -> Self {
        Self {
            source: source.into(),
            data: payload.data,
            metadata: payload.metadata,
            quality_score: payload.quality_score.clamp(0.0, 100.0),
            collection_timestamp: Utc::now(),
            errors: Vec::new(),
            warnings: payload.warnings,
            execution_time: 0.0,
            cache_hit: false,
            retry_count: 0,
        }
    }

    /// Degraded result for a call that did not produce data.
    pub fn degraded(source: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            data: Vec::new(),
            metadata: Map::new(),
            quality_score: 0.0,
            collection_timestamp: Utc::now(),
            errors: vec![error.into()],
            warnings: Vec::new(),
            execution_time: 0.0,
            cache_hit: false,
            retry_count: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Health of a collector's upstream source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result of a collector health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub error: Option<String>,
    pub details: Map<String, Value>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            status: HealthState::Healthy,
            error: None,
            details: Map::new(),
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            status: HealthState::Unhealthy,
            error: Some(error.into()),
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Running totals for one collector, owned by its executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorStats {
    pub total_collections: u64,
    pub successful_collections: u64,
    pub failed_collections: u64,
    pub cache_hits: u64,
    /// Cumulative execution time, in seconds.
    pub total_execution_time: f64,
}

impl CollectorStats {
    pub(crate) fn record_success(&mut self, elapsed: Duration) {
        self.total_collections += 1;
        self.successful_collections += 1;
        self.total_execution_time += elapsed.as_secs_f64();
    }

    pub(crate) fn record_failure(&mut self, elapsed: Duration) {
        self.total_collections += 1;
        self.failed_collections += 1;
        self.total_execution_time += elapsed.as_secs_f64();
    }

    pub(crate) fn record_cache_hit(&mut self) {
        self.total_collections += 1;
        self.successful_collections += 1;
        self.cache_hits += 1;
    }

    /// Percentage of collections that succeeded (0 when none ran).
    pub fn success_rate(&self) -> f64 {
        if self.total_collections == 0 {
            0.0
        } else {
            self.successful_collections as f64 / self.total_collections as f64 * 100.0
        }
    }

    pub fn average_execution_time(&self) -> f64 {
        let executed = self.total_collections - self.cache_hits;
        if executed == 0 {
            0.0
        } else {
            self.total_execution_time / executed as f64
        }
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
