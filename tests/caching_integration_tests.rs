//! # Caching Integration Tests
//!
//! End-to-end behavior of the response cache, the query cache and the API middleware over the
//! in-memory backend, plus degradation over a failing backend.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use cache_engine::caching::stores::{CacheBackend, CacheStoreStats, InMemoryBackend, InMemoryBackendConfig};
use cache_engine::caching::{
    CacheError, CacheEvent, CacheResult, EventBus, InvalidationConfig, KeyGenerator, QueryAnalyzer,
    QueryCache, QueryCacheConfig, QueryExecutor, QueryInvalidator, QueryOptions, ResponseCache,
    ResponseCacheConfig, ResponseCacheOptions, ResponseLookup,
};
use cache_engine::middleware::{ApiCacheConfig, ApiCacheMiddleware, Downstream};
use cache_engine::{ApiResponse, EngineResult, IncomingRequest};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn create_test_request(method: Method, uri: &str, headers: &[(&'static str, &str)]) -> IncomingRequest {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(*name, HeaderValue::from_str(value).unwrap());
    }
    IncomingRequest::new(
        method,
        uri.parse().unwrap(),
        map,
        Vec::new(),
        "10.0.0.1:5000".parse().unwrap(),
    )
}

fn create_test_backend() -> Arc<InMemoryBackend> {
    Arc::new(InMemoryBackend::new(InMemoryBackendConfig::default()))
}

fn create_test_response_cache(backend: Arc<dyn CacheBackend>, events: EventBus) -> ResponseCache {
    ResponseCache::new(ResponseCacheConfig::default(), backend, events)
}

fn create_test_query_cache(backend: Arc<dyn CacheBackend>, events: EventBus) -> QueryCache {
    let invalidator = QueryInvalidator::new(InvalidationConfig::default(), backend.clone(), events.clone());
    QueryCache::new(
        QueryCacheConfig::default(),
        backend,
        QueryAnalyzer::default(),
        invalidator,
        events,
    )
}

struct CountingExecutor {
    calls: AtomicUsize,
}

impl CountingExecutor {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl QueryExecutor for CountingExecutor {
    async fn execute(&self, _sql: &str, params: &[Value]) -> EngineResult<Option<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(json!([{ "id": 1, "params": params }])))
    }
}

struct JsonHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl Downstream for JsonHandler {
    async fn handle(&self, request: &IncomingRequest) -> EngineResult<ApiResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ApiResponse::json(StatusCode::OK, &json!({ "path": request.path() }))?)
    }
}

/// Backend whose every operation fails
struct FailingBackend;

#[async_trait]
impl CacheBackend for FailingBackend {
    async fn get(&self, _namespace: &str, _key: &str) -> CacheResult<Option<Vec<u8>>> {
        Err(CacheError::Unavailable)
    }

    async fn set(
        &self,
        _namespace: &str,
        _key: &str,
        _value: &[u8],
        _ttl: Duration,
        _tags: &[String],
    ) -> CacheResult<bool> {
        Err(CacheError::Unavailable)
    }

    async fn delete(&self, _namespace: &str, _key: &str) -> CacheResult<bool> {
        Err(CacheError::Unavailable)
    }

    async fn delete_pattern(&self, _namespace: &str, _pattern: &str) -> CacheResult<u64> {
        Err(CacheError::Unavailable)
    }

    async fn delete_by_tag(&self, _namespace: &str, _tag: &str) -> CacheResult<u64> {
        Err(CacheError::Unavailable)
    }

    async fn ttl(&self, _namespace: &str, _key: &str) -> CacheResult<Option<Duration>> {
        Err(CacheError::Unavailable)
    }

    async fn keys(&self, _namespace: &str, _pattern: &str) -> CacheResult<Vec<String>> {
        Err(CacheError::Unavailable)
    }

    async fn stats(&self) -> CacheResult<CacheStoreStats> {
        Err(CacheError::Unavailable)
    }

    async fn health_check(&self) -> CacheResult<bool> {
        Ok(false)
    }
}

#[test]
fn test_keys_are_deterministic_and_vary() {
    let keys = KeyGenerator::new(&["accept".to_string()]);

    let a = create_test_request(Method::GET, "/api/items?b=2&a=1", &[("accept", "application/json")]);
    let b = create_test_request(Method::GET, "/api/items?a=1&b=2", &[("accept", "application/json")]);
    let c = create_test_request(Method::GET, "/api/items?a=1&b=2", &[("accept", "text/html")]);

    assert_eq!(keys.response_key(&a).unwrap(), keys.response_key(&b).unwrap());
    assert_ne!(keys.response_key(&b).unwrap(), keys.response_key(&c).unwrap());

    let q1 = keys.query_key("SELECT * FROM t WHERE id = ?", &[json!(1)], &Value::Null).unwrap();
    let q2 = keys.query_key("select *   from t where id = ?", &[json!(1)], &Value::Null).unwrap();
    let q3 = keys.query_key("SELECT * FROM t WHERE id = ?", &[json!(2)], &Value::Null).unwrap();
    assert_eq!(q1, q2);
    assert_ne!(q1, q3);
}

#[tokio::test]
async fn test_path_classes_select_ttl() {
    let cache = create_test_response_cache(create_test_backend(), EventBus::default());
    let body = ApiResponse::text(StatusCode::OK, "payload");

    let api = create_test_request(Method::GET, "/api/public/products", &[]);
    let asset = create_test_request(Method::GET, "/static/app.css", &[]);
    assert!(cache.set(&api, &body, &ResponseCacheOptions::default()).await);
    assert!(cache.set(&asset, &body, &ResponseCacheOptions::default()).await);

    match cache.get(&api).await {
        ResponseLookup::Hit(entry) => assert_eq!(entry.ttl, 3600),
        other => panic!("expected hit, got {:?}", other),
    }
    match cache.get(&asset).await {
        ResponseLookup::Hit(entry) => assert_eq!(entry.ttl, 86400),
        other => panic!("expected hit, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_ttl_boundary() {
    let cache = create_test_response_cache(create_test_backend(), EventBus::default());
    let request = create_test_request(Method::GET, "/api/catalog", &[]);
    let options = ResponseCacheOptions {
        ttl: Some(Duration::from_secs(10)),
        ..Default::default()
    };
    assert!(cache.set(&request, &ApiResponse::text(StatusCode::OK, "x"), &options).await);

    tokio::time::advance(Duration::from_secs(9)).await;
    assert!(matches!(cache.get(&request).await, ResponseLookup::Hit(_)));

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(matches!(cache.get(&request).await, ResponseLookup::Miss));
}

#[tokio::test]
async fn test_middleware_revalidation_flow() {
    let cache = Arc::new(create_test_response_cache(create_test_backend(), EventBus::default()));
    let middleware = ApiCacheMiddleware::new(ApiCacheConfig::default(), cache).unwrap();
    let handler = JsonHandler {
        calls: AtomicUsize::new(0),
    };

    let request = create_test_request(Method::GET, "/api/public/products", &[]);
    let miss = middleware.handle(&request, &handler).await.unwrap();
    assert_eq!(miss.header("x-cache"), Some("MISS"));

    let hit = middleware.handle(&request, &handler).await.unwrap();
    assert_eq!(hit.header("x-cache"), Some("HIT"));
    let etag = hit.header("etag").unwrap().to_string();

    let conditional = create_test_request(Method::GET, "/api/public/products", &[("if-none-match", etag.as_str())]);
    let not_modified = middleware.handle(&conditional, &handler).await.unwrap();
    assert_eq!(not_modified.status, StatusCode::NOT_MODIFIED);
    assert!(not_modified.header("x-ratelimit-remaining").is_some());

    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_table_invalidation_forces_re_execution() {
    let cache = create_test_query_cache(create_test_backend(), EventBus::default());
    let executor = CountingExecutor::new();
    let sql = "SELECT * FROM orders WHERE customer_id = ?";
    let params = vec![json!(42)];

    let first = cache.execute(sql, &params, &QueryOptions::default(), &executor).await.unwrap();
    let second = cache.execute(sql, &params, &QueryOptions::default(), &executor).await.unwrap();
    assert!(!first.cache_hit);
    assert!(second.cache_hit);

    let report = cache.invalidate_table("orders").await;
    assert_eq!(report.affected_count(), 1);

    let third = cache.execute(sql, &params, &QueryOptions::default(), &executor).await.unwrap();
    assert!(!third.cache_hit);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failing_backend_degrades_to_uncached() {
    let backend: Arc<dyn CacheBackend> = Arc::new(FailingBackend);
    let events = EventBus::default();
    let mut receiver = events.subscribe();

    let responses = create_test_response_cache(backend.clone(), events.clone());
    let request = create_test_request(Method::GET, "/api/items", &[]);
    assert!(matches!(responses.get(&request).await, ResponseLookup::Miss));
    assert!(
        !responses
            .set(&request, &ApiResponse::text(StatusCode::OK, "x"), &ResponseCacheOptions::default())
            .await
    );

    let queries = create_test_query_cache(backend, events);
    let executor = CountingExecutor::new();
    let sql = "SELECT * FROM items";
    for _ in 0..2 {
        let outcome = queries.execute(sql, &[], &QueryOptions::default(), &executor).await.unwrap();
        assert!(!outcome.cache_hit);
        assert!(outcome.rows.is_some());
    }
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);

    let mut saw_error = false;
    while let Ok(event) = receiver.try_recv() {
        if matches!(event, CacheEvent::Error { .. }) {
            saw_error = true;
        }
    }
    assert!(saw_error);
}
