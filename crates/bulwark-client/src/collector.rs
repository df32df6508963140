use std::time::{Duration, Instant};

use bulwark_core::error::{AppError, ErrorKind};
use bulwark_core::models::{HealthReport, HealthState, Payload};
use bulwark_core::traits::{Collector, Params};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use url::Url;

/// Collector for JSON APIs that answer `GET {base_url}?q=<target>&<params>`.
///
/// Items are taken from the JSON pointer given with
/// [`with_items_pointer`](Self::with_items_pointer); by default the response
/// must be an array or an object with a `records` array.
#[derive(Clone)]
pub struct HttpJsonCollector {
    name: String,
    base_url: Url,
    client: Client,
    items_pointer: Option<String>,
}

impl HttpJsonCollector {
    pub fn new(name: impl Into<String>, base_url: &str) -> Result<Self, AppError> {
        Self::with_timeout(name, base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(
        name: impl Into<String>,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| AppError::Config(format!("Invalid collector URL '{base_url}': {e}")))?;
        let client = Client::builder()
            .user_agent("Bulwark/0.1 (data collector)")
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url,
            client,
            items_pointer: None,
        })
    }

    /// Read items from this JSON pointer (e.g. `/data/results`).
    pub fn with_items_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.items_pointer = Some(pointer.into());
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn extract_items(&self, body: Value) -> Result<Vec<Value>, AppError> {
        let items = match &self.items_pointer {
            Some(pointer) => body.pointer(pointer).cloned().ok_or_else(|| {
                AppError::upstream(
                    ErrorKind::Parse,
                    format!("No value at '{pointer}' in response"),
                )
            })?,
            None => match body {
                Value::Array(_) => body,
                Value::Object(mut map) => map.remove("records").ok_or_else(|| {
                    AppError::upstream(ErrorKind::Parse, "Response has no 'records' array")
                })?,
                other => other,
            },
        };

        match items {
            Value::Array(items) => Ok(items),
            other => Err(AppError::upstream(
                ErrorKind::Parse,
                format!("Expected an array of items, got {}", type_name(&other)),
            )),
        }
    }
}

/// Map a transport failure to an error kind.
fn transport_error(e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::timeout(format!("Request timed out: {e}"))
    } else if e.is_connect() {
        AppError::network(format!("Connection failed: {e}"))
    } else if e.is_builder() {
        AppError::upstream(ErrorKind::InvalidInput, format!("Invalid request: {e}"))
    } else if e.is_redirect() {
        AppError::upstream(ErrorKind::Client, format!("Redirect failed: {e}"))
    } else if e.is_decode() {
        AppError::upstream(ErrorKind::Parse, format!("Undecodable response body: {e}"))
    } else {
        AppError::network(e.to_string())
    }
}

/// Map a non-success HTTP status to an error kind.
fn status_error(status: StatusCode, url: &Url, retry_after: Option<&str>) -> AppError {
    let kind = if status == StatusCode::TOO_MANY_REQUESTS {
        ErrorKind::Throttled
    } else if status.is_server_error() {
        ErrorKind::Server
    } else {
        ErrorKind::Client
    };
    let mut message = format!("HTTP {} for {}", status.as_u16(), url);
    if let Some(retry_after) = retry_after {
        message.push_str(&format!(" (retry after {retry_after})"));
    }
    AppError::upstream(kind, message)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Mean share of non-null fields across items, as a 0–100 score.
pub fn completeness_score(items: &[Value]) -> f64 {
    if items.is_empty() {
        return 0.0;
    }
    let total: f64 = items
        .iter()
        .map(|item| match item {
            Value::Object(fields) if fields.is_empty() => 0.0,
            Value::Object(fields) => {
                let filled = fields.values().filter(|v| !v.is_null()).count();
                filled as f64 / fields.len() as f64
            }
            Value::Null => 0.0,
            _ => 1.0,
        })
        .sum();
    total / items.len() as f64 * 100.0
}

impl Collector for HttpJsonCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, target: &str, params: &Params) -> Result<Payload, AppError> {
        tracing::debug!(collector = %self.name, %target, url = %self.base_url, "Fetching");

        let response = self
            .client
            .get(self.base_url.clone())
            .query(&[("q", target)])
            .query(params)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok());
            return Err(status_error(status, response.url(), retry_after));
        }

        let bytes = response.bytes().await.map_err(transport_error)?;
        let body: Value = serde_json::from_slice(&bytes).map_err(|e| {
            AppError::upstream(ErrorKind::Parse, format!("Invalid JSON response: {e}"))
        })?;
        let items = self.extract_items(body)?;

        let quality_score = completeness_score(&items);
        let item_count = items.len();
        let mut payload = Payload::new(items, quality_score)
            .with_metadata("url", self.base_url.as_str())
            .with_metadata("status", status.as_u16())
            .with_metadata("item_count", item_count);
        if item_count == 0 {
            payload = payload.with_warning(format!("No items returned for '{target}'"));
        }
        Ok(payload)
    }

    fn validate_config(&self) -> bool {
        !self.name.trim().is_empty()
            && matches!(self.base_url.scheme(), "http" | "https")
            && self.base_url.host_str().is_some()
    }

    async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let result = self.client.get(self.base_url.clone()).send().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) if response.status().is_success() => HealthReport::healthy()
                .with_detail("status", response.status().as_u16())
                .with_detail("latency_ms", latency_ms),
            Ok(response) => {
                let status = response.status();
                let mut report = HealthReport::unhealthy(format!("HTTP {}", status.as_u16()))
                    .with_detail("status", status.as_u16())
                    .with_detail("latency_ms", latency_ms);
                if status == StatusCode::TOO_MANY_REQUESTS {
                    report.status = HealthState::Degraded;
                }
                report
            }
            Err(e) => HealthReport::unhealthy(transport_error(e).to_string())
                .with_detail("latency_ms", latency_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::SocketAddr;

    use axum::Router;
    use axum::extract::Query;
    use axum::http::StatusCode as AxumStatus;
    use axum::response::{IntoResponse, Redirect};
    use axum::routing::get;
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;

    async fn companies(Query(query): Query<HashMap<String, String>>) -> impl IntoResponse {
        let q = query.get("q").cloned().unwrap_or_default();
        let year = query.get("year").cloned();
        axum::Json(json!([
            { "name": q, "siren": "552100554", "year": year },
            { "name": "Other", "siren": null, "year": null },
        ]))
    }

    async fn spawn_stub() -> SocketAddr {
        let app = Router::new()
            .route("/companies", get(companies))
            .route(
                "/records",
                get(|| async { axum::Json(json!({ "records": [{ "id": 1 }, { "id": 2 }] })) }),
            )
            .route(
                "/nested",
                get(|| async { axum::Json(json!({ "data": { "results": [{ "id": 1 }] } })) }),
            )
            .route("/empty", get(|| async { axum::Json(json!([])) }))
            .route(
                "/throttled",
                get(|| async { (AxumStatus::TOO_MANY_REQUESTS, [("retry-after", "30")], "slow down") }),
            )
            .route(
                "/broken",
                get(|| async { (AxumStatus::INTERNAL_SERVER_ERROR, "boom") }),
            )
            .route("/missing", get(|| async { (AxumStatus::NOT_FOUND, "nope") }))
            .route("/garbage", get(|| async { "not json" }))
            .route("/loop", get(|| async { Redirect::temporary("/loop") }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    axum::Json(json!([]))
                }),
            );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn collector(addr: SocketAddr, path: &str) -> HttpJsonCollector {
        HttpJsonCollector::with_timeout(
            "stub",
            &format!("http://{addr}{path}"),
            Duration::from_millis(500),
        )
        .unwrap()
    }

    async fn fetch_kind(addr: SocketAddr, path: &str) -> ErrorKind {
        collector(addr, path)
            .fetch("acme", &Params::new())
            .await
            .unwrap_err()
            .kind()
    }

    #[tokio::test]
    async fn test_fetch_sends_target_and_params() {
        let addr = spawn_stub().await;
        let mut params = Params::new();
        params.insert("year".into(), "2024".into());

        let payload = collector(addr, "/companies")
            .fetch("Acme SA", &params)
            .await
            .unwrap();

        assert_eq!(payload.data.len(), 2);
        assert_eq!(payload.data[0]["name"], "Acme SA");
        assert_eq!(payload.data[0]["year"], "2024");
        assert_eq!(payload.metadata["item_count"], 2);
        // (3/3 + 1/3) / 2
        assert!((payload.quality_score - 66.666).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_item_extraction() {
        let addr = spawn_stub().await;

        let records = collector(addr, "/records")
            .fetch("acme", &Params::new())
            .await
            .unwrap();
        assert_eq!(records.data.len(), 2);
        assert_eq!(records.quality_score, 100.0);

        let nested = collector(addr, "/nested")
            .with_items_pointer("/data/results")
            .fetch("acme", &Params::new())
            .await
            .unwrap();
        assert_eq!(nested.data.len(), 1);

        let empty = collector(addr, "/empty")
            .fetch("acme", &Params::new())
            .await
            .unwrap();
        assert!(empty.data.is_empty());
        assert_eq!(empty.quality_score, 0.0);
        assert_eq!(empty.warnings.len(), 1);

        let wrong_pointer = collector(addr, "/records")
            .with_items_pointer("/data")
            .fetch("acme", &Params::new())
            .await
            .unwrap_err();
        assert_eq!(wrong_pointer.kind(), ErrorKind::Parse);
    }

    #[tokio::test]
    async fn test_status_classification() {
        let addr = spawn_stub().await;
        assert_eq!(fetch_kind(addr, "/throttled").await, ErrorKind::Throttled);
        assert_eq!(fetch_kind(addr, "/broken").await, ErrorKind::Server);
        assert_eq!(fetch_kind(addr, "/missing").await, ErrorKind::Client);
        assert_eq!(fetch_kind(addr, "/garbage").await, ErrorKind::Parse);
        assert_eq!(fetch_kind(addr, "/slow").await, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_redirect_loop_is_not_retryable() {
        let addr = spawn_stub().await;
        let kind = fetch_kind(addr, "/loop").await;
        assert_eq!(kind, ErrorKind::Client);
        assert!(!ErrorKind::transient().contains(&kind));
    }

    #[tokio::test]
    async fn test_throttled_message_carries_retry_after() {
        let addr = spawn_stub().await;
        let err = collector(addr, "/throttled")
            .fetch("acme", &Params::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("retry after 30"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_network() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert_eq!(fetch_kind(addr, "/companies").await, ErrorKind::Network);
        let report = collector(addr, "/companies").health_check().await;
        assert_eq!(report.status, HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn test_health_check() {
        let addr = spawn_stub().await;
        assert_eq!(
            collector(addr, "/companies").health_check().await.status,
            HealthState::Healthy
        );
        assert_eq!(
            collector(addr, "/throttled").health_check().await.status,
            HealthState::Degraded
        );
        assert_eq!(
            collector(addr, "/broken").health_check().await.status,
            HealthState::Unhealthy
        );
    }

    #[test]
    fn test_validate_config() {
        assert!(HttpJsonCollector::new("insee", "https://api.example.com/v1").unwrap().validate_config());
        assert!(!HttpJsonCollector::new("ftp", "ftp://example.com/data").unwrap().validate_config());
        assert!(!HttpJsonCollector::new(" ", "https://example.com").unwrap().validate_config());
        assert!(HttpJsonCollector::new("bad", "not a url").is_err());
    }

    #[test]
    fn test_completeness_score() {
        assert_eq!(completeness_score(&[]), 0.0);
        assert_eq!(completeness_score(&[json!({ "a": 1, "b": null })]), 50.0);
        assert_eq!(completeness_score(&[json!("x"), json!(null)]), 50.0);
    }
}
