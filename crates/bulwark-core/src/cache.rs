use std::time::Duration;

use moka::future::Cache;

use crate::config::CacheSettings;
use crate::models::{CollectionResult, compute_hash};
use crate::traits::Params;

/// Bounded, TTL-evicting cache of successful collection results.
///
/// Process-local and explicitly owned: create one at startup and hand it to
/// the executors that should share it. Clones share the same storage.
#[derive(Clone)]
pub struct ResultCache {
    inner: Cache<String, CollectionResult>,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("entries", &self.inner.entry_count())
            .finish()
    }
}

impl ResultCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(
            settings.max_capacity,
            Duration::from_secs(settings.ttl_seconds),
        )
    }

    /// Cache key for one collector call. Every part is JSON-encoded, so
    /// separators inside names or values cannot collide.
    pub fn key(collector: &str, target: &str, params: &Params) -> String {
        let encoded = serde_json::json!([collector, target, params]).to_string();
        compute_hash(&encoded)
    }

    pub async fn get(&self, key: &str) -> Option<CollectionResult> {
        self.inner.get(key).await
    }

    pub async fn insert(&self, key: String, result: CollectionResult) {
        self.inner.insert(key, result).await;
    }

    pub async fn invalidate(&self, key: &str) {
        self.inner.invalidate(key).await;
    }

    pub fn clear(&self) {
        self.inner.invalidate_all();
    }

    /// Approximate number of live entries.
    pub fn len(&self) -> u64 {
        self.inner.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
