//! # API Cache Middleware
//!
//! Wires the [`ResponseCache`] into a request pipeline around a [`Downstream`] handler.
//!
//! ## Request flow
//! 1. **Rate limiting**: sliding window per client IP (or per user for upstream-authenticated
//!    callers); forwarding headers count only from `trusted_proxies`. Rejections surface as
//!    [`crate::core::error::EngineError::RateLimitExceeded`] and every response carries `X-RateLimit-*` headers
//! 2. **Gating**: method allow-list, exclude list, optional include list, credentialed
//!    requests to user-scoped paths and `Cache-Control: no-store|no-cache` requests bypass the
//!    cache
//! 3. **Lookup**: hits are served with `X-Cache: HIT`, matching validators get a 304
//! 4. **Fill**: misses call downstream; 2xx responses with a body are stored and served with
//!    `X-Cache: MISS`. Concurrent misses for one key share a single downstream call. A
//!    comma-separated `X-Cache-Tags` response header becomes the entry's invalidation tags.

use crate::caching::deduplication::InFlightRegistry;
use crate::caching::response_cache::{ResponseCache, ResponseCacheOptions, ResponseLookup};
use crate::caching::stores::glob_match;
use crate::core::error::EngineResult;
use crate::core::types::{ApiResponse, IncomingRequest, RequestContext};
use crate::middleware::rate_limiting::{RateLimitConfig, RateLimitResult, SlidingWindowLimiter};
use crate::observability::metrics::CacheMetrics;
use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// API middleware configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiCacheConfig {
    /// Serve and fill the cache; rate limiting still applies when off
    pub enabled: bool,

    /// Methods eligible for caching
    pub cacheable_methods: Vec<String>,

    /// Glob patterns of paths never cached
    pub exclude_paths: Vec<String>,

    /// Glob patterns of the only paths cached; empty means every path
    pub include_paths: Vec<String>,

    /// Honor `Cache-Control: no-store` and `no-cache` on requests
    pub respect_request_cache_control: bool,

    /// Coalesce concurrent misses for the same key
    pub enable_single_flight: bool,

    /// Header carrying an explicit client identity, honored only from a trusted proxy
    pub client_id_header: String,

    /// Proxies whose `X-Forwarded-For` and client id headers are believed. Empty means the
    /// socket address alone identifies the client.
    pub trusted_proxies: Vec<IpAddr>,

    /// Sliding window rate limiting
    pub rate_limit: RateLimitConfig,
}

impl Default for ApiCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cacheable_methods: vec!["GET".to_string(), "HEAD".to_string()],
            exclude_paths: Vec::new(),
            include_paths: Vec::new(),
            respect_request_cache_control: true,
            enable_single_flight: true,
            client_id_header: "x-client-id".to_string(),
            trusted_proxies: Vec::new(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Handler invoked on a cache miss
#[async_trait]
pub trait Downstream: Send + Sync {
    async fn handle(&self, request: &IncomingRequest) -> EngineResult<ApiResponse>;
}

/// Why a request skipped the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    Disabled,
    Method,
    Excluded,
    NotIncluded,
    Credentials,
    RequestCacheControl,
}

impl BypassReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Method => "method",
            Self::Excluded => "excluded",
            Self::NotIncluded => "not_included",
            Self::Credentials => "credentials",
            Self::RequestCacheControl => "cache_control",
        }
    }
}

/// Middleware statistics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiCacheStats {
    pub requests: u64,
    pub hits: u64,
    pub not_modified: u64,
    pub misses: u64,
    pub bypassed: u64,
    pub rate_limited: u64,
    pub shared: u64,
    pub stored: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    hits: AtomicU64,
    not_modified: AtomicU64,
    misses: AtomicU64,
    bypassed: AtomicU64,
    rate_limited: AtomicU64,
    shared: AtomicU64,
    stored: AtomicU64,
}

/// Request-interception middleware for the response cache
pub struct ApiCacheMiddleware {
    config: ApiCacheConfig,
    cache: Arc<ResponseCache>,
    limiter: SlidingWindowLimiter,
    flights: InFlightRegistry<ApiResponse>,
    methods: Vec<String>,
    metrics: CacheMetrics,
    counters: Counters,
}

impl ApiCacheMiddleware {
    pub fn new(config: ApiCacheConfig, cache: Arc<ResponseCache>) -> EngineResult<Self> {
        let limiter = SlidingWindowLimiter::new(config.rate_limit.clone())?;
        let methods = config
            .cacheable_methods
            .iter()
            .map(|m| m.to_ascii_uppercase())
            .collect();

        Ok(Self {
            config,
            cache,
            limiter,
            flights: InFlightRegistry::new(),
            methods,
            metrics: CacheMetrics,
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &ApiCacheConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn limiter(&self) -> &SlidingWindowLimiter {
        &self.limiter
    }

    /// Process a request through rate limiting, the cache and, on a miss, downstream
    pub async fn handle(
        &self,
        request: &IncomingRequest,
        downstream: &dyn Downstream,
    ) -> EngineResult<ApiResponse> {
        let client = self.client_identity(request);
        self.process(request, &client, false, downstream).await
    }

    /// Process a request whose caller was authenticated upstream. The user id becomes the
    /// rate limit identity and the request counts as credentialed.
    pub async fn handle_context(
        &self,
        context: &RequestContext,
        downstream: &dyn Downstream,
    ) -> EngineResult<ApiResponse> {
        let request = context.request.as_ref();
        let response = match &context.auth_context {
            Some(auth) => {
                let client = format!("user:{}", auth.user_id);
                self.process(request, &client, true, downstream).await
            }
            None => self.handle(request, downstream).await,
        };

        debug!(
            "Handled {} {} in {:?} (trace {})",
            request.method,
            request.path(),
            context.elapsed(),
            context.trace_id
        );
        response
    }

    /// Reason the request skips the cache, `None` when it may be served from it
    pub fn bypass_reason(&self, request: &IncomingRequest) -> Option<BypassReason> {
        self.bypass_reason_for(request, false)
    }

    async fn process(
        &self,
        request: &IncomingRequest,
        client: &str,
        authenticated: bool,
        downstream: &dyn Downstream,
    ) -> EngineResult<ApiResponse> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let limit = self.limiter.check(client, request.path());
        if !limit.allowed {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_rate_limited();
            return Err(limit.to_error(self.config.rate_limit.window));
        }

        let mut response = match self.bypass_reason_for(request, authenticated) {
            Some(reason) => {
                debug!(
                    "Bypassing cache for {} {} ({})",
                    request.method,
                    request.path(),
                    reason.as_str()
                );
                self.counters.bypassed.fetch_add(1, Ordering::Relaxed);
                downstream.handle(request).await?
            }
            None => self.serve(request, downstream).await?,
        };

        apply_rate_limit_headers(&mut response.headers, &limit);
        Ok(response)
    }

    fn bypass_reason_for(&self, request: &IncomingRequest, authenticated: bool) -> Option<BypassReason> {
        let path = request.path();

        if !self.config.enabled {
            return Some(BypassReason::Disabled);
        }
        if !self.methods.iter().any(|m| m == request.method.as_str()) {
            return Some(BypassReason::Method);
        }
        if self.config.exclude_paths.iter().any(|p| glob_match(p, path)) {
            return Some(BypassReason::Excluded);
        }
        if !self.config.include_paths.is_empty()
            && !self.config.include_paths.iter().any(|p| glob_match(p, path))
        {
            return Some(BypassReason::NotIncluded);
        }
        if (authenticated || request.has_credentials()) && self.is_user_scoped(path) {
            return Some(BypassReason::Credentials);
        }
        if self.config.respect_request_cache_control {
            if let Some(cache_control) = request.header("cache-control") {
                let lower = cache_control.to_ascii_lowercase();
                if lower.contains("no-store") || lower.contains("no-cache") {
                    return Some(BypassReason::RequestCacheControl);
                }
            }
        }
        None
    }

    /// Statistics snapshot
    pub fn stats(&self) -> ApiCacheStats {
        ApiCacheStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            not_modified: self.counters.not_modified.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            bypassed: self.counters.bypassed.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            shared: self.counters.shared.load(Ordering::Relaxed),
            stored: self.counters.stored.load(Ordering::Relaxed),
        }
    }

    async fn serve(
        &self,
        request: &IncomingRequest,
        downstream: &dyn Downstream,
    ) -> EngineResult<ApiResponse> {
        match self.cache.get(request).await {
            ResponseLookup::Hit(entry) => {
                if let Some(response) = self.cache.render(&entry, "HIT") {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(response);
                }
            }
            ResponseLookup::NotModified(entry) => {
                self.counters.not_modified.fetch_add(1, Ordering::Relaxed);
                return Ok(self.cache.render_not_modified(&entry));
            }
            ResponseLookup::Miss => {}
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let flight_key = match self.cache.key_generator().response_key(request) {
            Ok(key) if self.config.enable_single_flight => key,
            _ => return self.fetch_and_store(request, downstream).await,
        };

        let (response, shared) = self
            .flights
            .execute(&flight_key, || self.fetch_and_store(request, downstream))
            .await?;
        if shared {
            self.counters.shared.fetch_add(1, Ordering::Relaxed);
        }
        Ok(response)
    }

    async fn fetch_and_store(
        &self,
        request: &IncomingRequest,
        downstream: &dyn Downstream,
    ) -> EngineResult<ApiResponse> {
        let mut response = downstream.handle(request).await?;

        let options = ResponseCacheOptions {
            tags: response_tags(&response),
            ..Default::default()
        };
        if is_storable(&response) && self.cache.set(request, &response, &options).await {
            self.counters.stored.fetch_add(1, Ordering::Relaxed);
        }

        response
            .headers
            .insert("x-cache", HeaderValue::from_static("MISS"));
        Ok(response)
    }

    fn client_identity(&self, request: &IncomingRequest) -> String {
        let proxies = &self.config.trusted_proxies;
        if proxies.contains(&request.remote_addr.ip()) {
            if let Some(id) = request.header(&self.config.client_id_header) {
                return format!("id:{}", id);
            }
        }
        request.client_ip(proxies).to_string()
    }

    fn is_user_scoped(&self, path: &str) -> bool {
        let lower = path.to_ascii_lowercase();
        self.cache
            .config()
            .user_path_prefixes
            .iter()
            .any(|prefix| lower.starts_with(prefix.as_str()))
    }
}

/// Only successful, non-empty responses the origin allows to be shared are stored
fn is_storable(response: &ApiResponse) -> bool {
    if !response.status.is_success() || response.body.is_empty() {
        return false;
    }

    match response.header("cache-control") {
        Some(cache_control) => {
            let lower = cache_control.to_ascii_lowercase();
            !(lower.contains("no-store") || lower.contains("private"))
        }
        None => true,
    }
}

fn response_tags(response: &ApiResponse) -> Vec<String> {
    response
        .header("x-cache-tags")
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, limit: &RateLimitResult) {
    for (name, value) in limit.headers().iter() {
        headers.insert(name.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::events::EventBus;
    use crate::core::error::EngineError;
    use crate::core::types::AuthContext;
    use crate::caching::response_cache::ResponseCacheConfig;
    use crate::caching::stores::{InMemoryBackend, InMemoryBackendConfig};
    use axum::http::{Method, StatusCode};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingHandler {
        calls: AtomicUsize,
        status: StatusCode,
        body: &'static str,
        delay: Duration,
    }

    impl CountingHandler {
        fn ok(body: &'static str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                status: StatusCode::OK,
                body,
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Downstream for CountingHandler {
        async fn handle(&self, _request: &IncomingRequest) -> EngineResult<ApiResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(ApiResponse::text(self.status, self.body))
        }
    }

    fn create_test_middleware(config: ApiCacheConfig) -> ApiCacheMiddleware {
        let backend = Arc::new(InMemoryBackend::new(InMemoryBackendConfig::default()));
        let cache = Arc::new(ResponseCache::new(
            ResponseCacheConfig::default(),
            backend,
            EventBus::default(),
        ));
        ApiCacheMiddleware::new(config, cache).unwrap()
    }

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
            "127.0.0.1:8080".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let middleware = create_test_middleware(ApiCacheConfig::default());
        let handler = CountingHandler::ok("products");
        let request = create_test_request(Method::GET, "/api/public/products", &[]);

        let first = middleware.handle(&request, &handler).await.unwrap();
        assert_eq!(first.header("x-cache"), Some("MISS"));
        assert!(first.header("x-ratelimit-limit").is_some());

        let second = middleware.handle(&request, &handler).await.unwrap();
        assert_eq!(second.header("x-cache"), Some("HIT"));
        assert_eq!(second.body.as_slice(), b"products");
        assert!(second.header("etag").is_some());
        assert_eq!(handler.calls(), 1);

        let stats = middleware.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.stored, 1);
    }

    #[tokio::test]
    async fn test_conditional_request_gets_not_modified() {
        let middleware = create_test_middleware(ApiCacheConfig::default());
        let handler = CountingHandler::ok("catalog");
        let request = create_test_request(Method::GET, "/api/catalog", &[]);

        let first = middleware.handle(&request, &handler).await.unwrap();
        let etag = middleware
            .handle(&request, &handler)
            .await
            .unwrap()
            .header("etag")
            .unwrap()
            .to_string();
        assert_eq!(first.status, StatusCode::OK);

        let conditional = create_test_request(Method::GET, "/api/catalog", &[("if-none-match", etag.as_str())]);
        let response = middleware.handle(&conditional, &handler).await.unwrap();
        assert_eq!(response.status, StatusCode::NOT_MODIFIED);
        assert!(response.body.is_empty());
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_gating_rules() {
        let middleware = create_test_middleware(ApiCacheConfig {
            exclude_paths: vec!["/api/auth/*".to_string()],
            ..Default::default()
        });

        let post = create_test_request(Method::POST, "/api/items", &[]);
        assert_eq!(middleware.bypass_reason(&post), Some(BypassReason::Method));

        let excluded = create_test_request(Method::GET, "/api/auth/login", &[]);
        assert_eq!(middleware.bypass_reason(&excluded), Some(BypassReason::Excluded));

        let credentialed =
            create_test_request(Method::GET, "/api/users/42", &[("authorization", "Bearer t")]);
        assert_eq!(
            middleware.bypass_reason(&credentialed),
            Some(BypassReason::Credentials)
        );

        let no_store = create_test_request(Method::GET, "/api/items", &[("cache-control", "no-store")]);
        assert_eq!(
            middleware.bypass_reason(&no_store),
            Some(BypassReason::RequestCacheControl)
        );

        let public = create_test_request(Method::GET, "/api/items", &[("authorization", "Bearer t")]);
        assert_eq!(middleware.bypass_reason(&public), None);
    }

    #[tokio::test]
    async fn test_authenticated_context_uses_user_identity() {
        let middleware = create_test_middleware(ApiCacheConfig {
            rate_limit: RateLimitConfig {
                max_requests: 1,
                ..Default::default()
            },
            ..Default::default()
        });
        let handler = CountingHandler::ok("profile");

        let request = Arc::new(create_test_request(Method::GET, "/api/users/42", &[]));
        let mut alice = RequestContext::new(request.clone());
        alice.set_auth_context(AuthContext {
            user_id: "alice".to_string(),
            roles: vec!["user".to_string()],
            auth_method: "jwt".to_string(),
        });
        let mut bob = RequestContext::new(request);
        bob.set_auth_context(AuthContext {
            user_id: "bob".to_string(),
            roles: Vec::new(),
            auth_method: "jwt".to_string(),
        });

        // same client IP, separate windows per user
        middleware.handle_context(&alice, &handler).await.unwrap();
        middleware.handle_context(&bob, &handler).await.unwrap();
        assert!(middleware.handle_context(&alice, &handler).await.is_err());

        // user-scoped path is never cached for authenticated callers
        assert_eq!(handler.calls(), 2);
        assert_eq!(middleware.stats().bypassed, 2);
    }

    #[tokio::test]
    async fn test_include_list_restricts_caching() {
        let middleware = create_test_middleware(ApiCacheConfig {
            include_paths: vec!["/api/catalog*".to_string()],
            ..Default::default()
        });

        let included = create_test_request(Method::GET, "/api/catalog/1", &[]);
        let other = create_test_request(Method::GET, "/api/orders", &[]);
        assert_eq!(middleware.bypass_reason(&included), None);
        assert_eq!(middleware.bypass_reason(&other), Some(BypassReason::NotIncluded));
    }

    #[tokio::test]
    async fn test_only_successful_non_empty_responses_are_stored() {
        let middleware = create_test_middleware(ApiCacheConfig::default());
        let request = create_test_request(Method::GET, "/api/missing", &[]);

        let not_found = CountingHandler {
            status: StatusCode::NOT_FOUND,
            ..CountingHandler::ok("nope")
        };
        middleware.handle(&request, &not_found).await.unwrap();
        middleware.handle(&request, &not_found).await.unwrap();
        assert_eq!(not_found.calls(), 2);

        let empty_request = create_test_request(Method::GET, "/api/empty", &[]);
        let empty = CountingHandler::ok("");
        middleware.handle(&empty_request, &empty).await.unwrap();
        middleware.handle(&empty_request, &empty).await.unwrap();
        assert_eq!(empty.calls(), 2);
        assert_eq!(middleware.stats().stored, 0);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_fourth_request() {
        let middleware = create_test_middleware(ApiCacheConfig {
            rate_limit: RateLimitConfig {
                window: Duration::from_secs(60),
                max_requests: 3,
                ..Default::default()
            },
            ..Default::default()
        });
        let handler = CountingHandler::ok("data");
        let request = create_test_request(Method::GET, "/api/data", &[]);

        let mut remaining = Vec::new();
        for _ in 0..3 {
            let response = middleware.handle(&request, &handler).await.unwrap();
            remaining.push(response.header("x-ratelimit-remaining").unwrap().to_string());
        }
        assert_eq!(remaining, vec!["2", "1", "0"]);

        match middleware.handle(&request, &handler).await {
            Err(EngineError::RateLimitExceeded { limit, remaining, .. }) => {
                assert_eq!(limit, 3);
                assert_eq!(remaining, 0);
            }
            other => panic!("expected rate limit rejection, got {:?}", other.map(|r| r.status)),
        }
        assert_eq!(middleware.stats().rate_limited, 1);
    }

    #[tokio::test]
    async fn test_response_tags_drive_invalidation() {
        struct TaggedHandler;

        #[async_trait]
        impl Downstream for TaggedHandler {
            async fn handle(&self, _request: &IncomingRequest) -> EngineResult<ApiResponse> {
                let mut response = ApiResponse::text(StatusCode::OK, "orders");
                response
                    .headers
                    .insert("x-cache-tags", HeaderValue::from_static("table:orders, tenant:7"));
                Ok(response)
            }
        }

        let middleware = create_test_middleware(ApiCacheConfig::default());
        let request = create_test_request(Method::GET, "/api/orders", &[]);
        middleware.handle(&request, &TaggedHandler).await.unwrap();

        let invalidated = middleware
            .cache()
            .invalidate_by_tags(&["table:orders".to_string()])
            .await;
        assert_eq!(invalidated, 1);

        let again = middleware.handle(&request, &TaggedHandler).await.unwrap();
        assert_eq!(again.header("x-cache"), Some("MISS"));
    }

    #[tokio::test]
    async fn test_rotating_identity_headers_share_one_window() {
        let middleware = create_test_middleware(ApiCacheConfig {
            rate_limit: RateLimitConfig {
                max_requests: 3,
                ..Default::default()
            },
            ..Default::default()
        });
        let handler = CountingHandler::ok("data");

        let mut allowed = 0;
        for i in 0..10 {
            let client_id = format!("client-{}", i);
            let forwarded = format!("198.51.100.{}", i);
            let request = create_test_request(
                Method::GET,
                "/api/data",
                &[("x-client-id", client_id.as_str()), ("x-forwarded-for", forwarded.as_str())],
            );
            if middleware.handle(&request, &handler).await.is_ok() {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 3);
        assert_eq!(middleware.stats().rate_limited, 7);
    }

    #[tokio::test]
    async fn test_trusted_proxy_forwards_client_identity() {
        let middleware = create_test_middleware(ApiCacheConfig {
            trusted_proxies: vec!["127.0.0.1".parse().unwrap()],
            rate_limit: RateLimitConfig {
                max_requests: 1,
                ..Default::default()
            },
            ..Default::default()
        });
        let handler = CountingHandler::ok("data");

        let first = create_test_request(Method::GET, "/api/data", &[("x-forwarded-for", "203.0.113.1")]);
        let second = create_test_request(Method::GET, "/api/data", &[("x-forwarded-for", "203.0.113.2")]);
        assert!(middleware.handle(&first, &handler).await.is_ok());
        assert!(middleware.handle(&second, &handler).await.is_ok());

        // a spoofed left-most hop does not escape the window of the real client
        let spoofed = create_test_request(
            Method::GET,
            "/api/data",
            &[("x-forwarded-for", "192.0.2.77, 203.0.113.1")],
        );
        assert!(middleware.handle(&spoofed, &handler).await.is_err());

        let tagged = create_test_request(Method::GET, "/api/data", &[("x-client-id", "mobile-app")]);
        assert!(middleware.handle(&tagged, &handler).await.is_ok());
        assert!(middleware.handle(&tagged, &handler).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_downstream_call() {
        let middleware = Arc::new(create_test_middleware(ApiCacheConfig::default()));
        let handler = Arc::new(CountingHandler {
            delay: Duration::from_millis(50),
            ..CountingHandler::ok("slow")
        });

        let mut handles = Vec::new();
        for _ in 0..5 {
            let middleware = middleware.clone();
            let handler = handler.clone();
            handles.push(tokio::spawn(async move {
                let request = create_test_request(Method::GET, "/api/slow", &[]);
                middleware.handle(&request, handler.as_ref()).await.unwrap()
            }));
        }

        for result in futures::future::join_all(handles).await {
            assert_eq!(result.unwrap().body.as_slice(), b"slow");
        }
        assert_eq!(handler.calls(), 1);
    }
}
