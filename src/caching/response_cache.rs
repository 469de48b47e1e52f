//! # Response Cache
//!
//! Caches full response payloads (status, caching-safe headers and body) keyed by the
//! normalized request identity.
//!
//! ## Features
//! - Path-class TTL selection: static assets, user-scoped paths, API reads and writes
//! - ETag / Last-Modified revalidation answered as not-modified
//! - Gzip compression of large, compressible bodies
//! - Pattern, endpoint and tag invalidation kept in sync with the local request index
//! - Named invalidation rules evaluated on data-change events
//!
//! Backend failures are logged, emitted as [`CacheEvent::Error`] and turned into misses or
//! `false`; they never reach the caller.

use super::compression::CompressionPolicy;
use super::entry::{parse_http_date, CacheEntry};
use super::events::{new_operation_id, CacheEvent, EventBus};
use super::key_generator::KeyGenerator;
use super::stores::{glob_match, CacheBackend};
use crate::core::types::{ApiResponse, IncomingRequest};
use crate::observability::metrics::CacheMetrics;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const CACHE_LABEL: &str = "responses";

/// Predicate over a request key and a data-change event
pub type InvalidationRule = Arc<dyn Fn(&str, &Value) -> bool + Send + Sync>;

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseCacheConfig {
    /// Backend namespace
    pub namespace: String,

    /// TTL for paths matching no other class
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    /// TTL for static assets
    #[serde(with = "humantime_serde")]
    pub static_ttl: Duration,

    /// TTL for API reads; falls back to `default_ttl`
    #[serde(with = "humantime_serde")]
    pub api_read_ttl: Option<Duration>,

    /// TTL for API responses to non-read methods
    #[serde(with = "humantime_serde")]
    pub api_write_ttl: Duration,

    /// TTL for user-scoped paths
    #[serde(with = "humantime_serde")]
    pub user_ttl: Duration,

    /// File extensions identifying static assets
    pub static_extensions: Vec<String>,

    /// Path prefixes identifying static assets
    pub static_path_prefixes: Vec<String>,

    /// Path prefixes identifying API endpoints
    pub api_path_prefixes: Vec<String>,

    /// Path prefixes identifying user-scoped endpoints
    pub user_path_prefixes: Vec<String>,

    /// Compress large bodies
    pub enable_compression: bool,

    /// Minimum body size considered for compression
    pub compression_threshold: usize,

    /// Maximum compressed/original ratio worth storing
    pub min_compression_ratio: f64,

    /// Bodies larger than this are never cached
    pub max_entry_size: usize,

    /// Request headers that select between representations
    pub vary_headers: Vec<String>,

    /// Response headers stored with the entry
    pub cacheable_headers: Vec<String>,

    /// Evaluate named rules on data-change events
    pub enable_smart_invalidation: bool,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            namespace: "responses".to_string(),
            default_ttl: Duration::from_secs(3600),
            static_ttl: Duration::from_secs(86400),
            api_read_ttl: None,
            api_write_ttl: Duration::from_secs(300),
            user_ttl: Duration::from_secs(900),
            static_extensions: [
                ".css", ".js", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".woff", ".woff2",
                ".ttf", ".map",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            static_path_prefixes: vec!["/static/".to_string(), "/assets/".to_string()],
            api_path_prefixes: vec!["/api/".to_string()],
            user_path_prefixes: vec![
                "/api/users/".to_string(),
                "/api/me".to_string(),
                "/api/account".to_string(),
                "/profile".to_string(),
            ],
            enable_compression: true,
            compression_threshold: 1024,
            min_compression_ratio: 0.8,
            max_entry_size: 1024 * 1024,
            vary_headers: vec![
                "accept".to_string(),
                "accept-encoding".to_string(),
                "accept-language".to_string(),
            ],
            cacheable_headers: vec![
                "content-type".to_string(),
                "content-language".to_string(),
                "content-encoding".to_string(),
                "vary".to_string(),
                "link".to_string(),
                "x-total-count".to_string(),
            ],
            enable_smart_invalidation: true,
        }
    }
}

/// Per-call options for [`ResponseCache::set`]
#[derive(Debug, Clone, Default)]
pub struct ResponseCacheOptions {
    /// Explicit TTL overriding the path-class TTL
    pub ttl: Option<Duration>,

    /// Extra invalidation tags
    pub tags: Vec<String>,
}

/// Outcome of a cache lookup
#[derive(Debug, Clone)]
pub enum ResponseLookup {
    /// Fresh entry, serve it in full
    Hit(CacheEntry),

    /// Fresh entry matching the request's validators, answer not-modified
    NotModified(CacheEntry),

    /// Nothing usable cached
    Miss,
}

/// Snapshot of response cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub not_modified: u64,
    pub sets: u64,
    pub errors: u64,
    pub invalidated_keys: u64,
    pub tracked_requests: usize,
    pub hit_ratio: f64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    not_modified: AtomicU64,
    sets: AtomicU64,
    errors: AtomicU64,
    invalidated_keys: AtomicU64,
}

/// Cache keys stored for one request identity, with their tags
type IndexEntry = HashMap<String, BTreeSet<String>>;

/// Response cache
pub struct ResponseCache {
    config: ResponseCacheConfig,
    backend: Arc<dyn CacheBackend>,
    keys: KeyGenerator,
    compression: Option<CompressionPolicy>,

    /// Request key → cache keys stored for it
    index: DashMap<String, IndexEntry>,

    /// Named smart-invalidation rules
    rules: RwLock<BTreeMap<String, InvalidationRule>>,

    events: EventBus,
    metrics: CacheMetrics,
    counters: Counters,
}

impl ResponseCache {
    /// Create a response cache over a backend
    pub fn new(config: ResponseCacheConfig, backend: Arc<dyn CacheBackend>, events: EventBus) -> Self {
        let compression = config.enable_compression.then(|| CompressionPolicy {
            threshold: config.compression_threshold,
            min_ratio: config.min_compression_ratio,
        });

        Self {
            keys: KeyGenerator::new(&config.vary_headers),
            compression,
            config,
            backend,
            index: DashMap::new(),
            rules: RwLock::new(BTreeMap::new()),
            events,
            metrics: CacheMetrics,
            counters: Counters::default(),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &ResponseCacheConfig {
        &self.config
    }

    /// Key generator in use
    pub fn key_generator(&self) -> &KeyGenerator {
        &self.keys
    }

    /// Look up a response, applying conditional-request semantics
    pub async fn get(&self, request: &IncomingRequest) -> ResponseLookup {
        let started = Instant::now();

        let (request_key, cache_key) = match self.derive_keys(request) {
            Some(keys) => keys,
            None => return ResponseLookup::Miss,
        };

        let bytes = match self.backend.get(&self.config.namespace, &cache_key).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.report_backend_error("get", &e.to_string());
                self.record_miss(&cache_key, started);
                return ResponseLookup::Miss;
            }
        };

        let entry = match bytes.map(|b| CacheEntry::from_bytes(&b)) {
            Some(Ok(entry)) if entry.is_fresh() => entry,
            Some(Ok(_)) => {
                debug!("Stale response entry for {}", request_key);
                self.forget(&request_key, &cache_key);
                self.record_miss(&cache_key, started);
                return ResponseLookup::Miss;
            }
            Some(Err(e)) => {
                warn!("Discarding undecodable response entry {}: {}", cache_key, e);
                self.report_backend_error("decode", &e.to_string());
                if let Err(e) = self.backend.delete(&self.config.namespace, &cache_key).await {
                    self.report_backend_error("delete", &e.to_string());
                }
                self.forget(&request_key, &cache_key);
                self.record_miss(&cache_key, started);
                return ResponseLookup::Miss;
            }
            None => {
                // expired in the backend; drop the stale index entry
                self.forget(&request_key, &cache_key);
                self.record_miss(&cache_key, started);
                return ResponseLookup::Miss;
            }
        };

        if is_not_modified(request, &entry) {
            self.counters.not_modified.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_not_modified(CACHE_LABEL);
            debug!("Conditional request for {} answered not-modified", request_key);
            return ResponseLookup::NotModified(entry);
        }

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_hit(CACHE_LABEL);
        self.metrics
            .record_operation(CACHE_LABEL, "get", started.elapsed());
        self.events.emit(CacheEvent::CacheHit {
            operation_id: new_operation_id(),
            cache: CACHE_LABEL.to_string(),
            key: cache_key,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        ResponseLookup::Hit(entry)
    }

    /// Store a downstream response. Returns whether it was stored.
    pub async fn set(
        &self,
        request: &IncomingRequest,
        response: &ApiResponse,
        options: &ResponseCacheOptions,
    ) -> bool {
        let started = Instant::now();

        let (request_key, cache_key) = match self.derive_keys(request) {
            Some(keys) => keys,
            None => return false,
        };

        if response.body.len() > self.config.max_entry_size {
            debug!(
                "Response for {} is {} bytes, above the {} byte limit",
                request_key,
                response.body.len(),
                self.config.max_entry_size
            );
            return false;
        }

        let ttl = options
            .ttl
            .unwrap_or_else(|| self.calculate_optimal_ttl(&request.method, request.path()));
        if ttl.is_zero() {
            return false;
        }

        let tags = self.tags_for(request, response.status, &options.tags);
        let mut entry = CacheEntry::new(response.body.to_vec(), ttl)
            .with_status(response.status.as_u16())
            .with_headers(self.cacheable_headers(&response.headers))
            .with_tags(tags.iter().cloned());

        if let Some(policy) = &self.compression {
            entry = match entry.clone().compress_with(policy) {
                Ok(compressed) => compressed,
                Err(e) => {
                    warn!("Compression failed for {}, storing uncompressed: {}", request_key, e);
                    entry
                }
            };
        }

        let bytes = match entry.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.report_backend_error("encode", &e.to_string());
                return false;
            }
        };

        let tag_list: Vec<String> = tags.iter().cloned().collect();
        match self
            .backend
            .set(&self.config.namespace, &cache_key, &bytes, ttl, &tag_list)
            .await
        {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                self.report_backend_error("set", &e.to_string());
                return false;
            }
        }

        self.index
            .entry(request_key.clone())
            .or_default()
            .insert(cache_key.clone(), tags);
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .record_operation(CACHE_LABEL, "set", started.elapsed());

        debug!(
            "Cached response for {} with TTL {:?} (compressed: {})",
            request_key, ttl, entry.compressed
        );
        self.events.emit(CacheEvent::ResponseCached {
            operation_id: new_operation_id(),
            key: cache_key,
            ttl: entry.ttl,
            size: entry.original_size,
            compressed: entry.compressed,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        true
    }

    /// TTL for a method and path: static assets, then user-scoped paths, then API paths
    /// (reads vs. writes), then the default
    pub fn calculate_optimal_ttl(&self, method: &Method, path: &str) -> Duration {
        let lower = path.to_ascii_lowercase();

        let is_static = self
            .config
            .static_path_prefixes
            .iter()
            .any(|p| lower.starts_with(p.as_str()))
            || self
                .config
                .static_extensions
                .iter()
                .any(|ext| lower.ends_with(ext.as_str()));
        if is_static {
            return self.config.static_ttl;
        }

        if self
            .config
            .user_path_prefixes
            .iter()
            .any(|p| lower.starts_with(p.as_str()))
        {
            return self.config.user_ttl;
        }

        if self
            .config
            .api_path_prefixes
            .iter()
            .any(|p| lower.starts_with(p.as_str()))
        {
            return if *method == Method::GET || *method == Method::HEAD {
                self.config.api_read_ttl.unwrap_or(self.config.default_ttl)
            } else {
                self.config.api_write_ttl
            };
        }

        self.config.default_ttl
    }

    /// Invalidate every tracked request matching any of the glob patterns
    pub async fn invalidate(&self, patterns: &[String]) -> usize {
        let started = Instant::now();

        let matching: Vec<String> = self
            .index
            .iter()
            .filter(|entry| patterns.iter().any(|p| glob_match(p, entry.key())))
            .map(|entry| entry.key().clone())
            .collect();

        let mut affected = 0;
        for request_key in matching {
            affected += self.invalidate_request_key(&request_key).await;
        }

        self.finish_invalidation(patterns.to_vec(), affected, started);
        affected
    }

    /// Invalidate every tracked request whose identity contains the endpoint
    pub async fn invalidate_endpoint(&self, endpoint: &str) -> usize {
        self.invalidate(&[format!("*{}*", endpoint)]).await
    }

    /// Invalidate every entry carrying any of the tags
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> usize {
        let started = Instant::now();
        let mut affected = 0usize;

        for tag in tags {
            let local: Vec<(String, String)> = self
                .index
                .iter()
                .flat_map(|entry| {
                    let request_key = entry.key().clone();
                    entry
                        .value()
                        .iter()
                        .filter(|(_, entry_tags)| entry_tags.contains(tag))
                        .map(|(cache_key, _)| (request_key.clone(), cache_key.clone()))
                        .collect::<Vec<_>>()
                })
                .collect();

            match self.backend.delete_by_tag(&self.config.namespace, tag).await {
                Ok(deleted) => affected += deleted as usize,
                Err(e) => {
                    self.report_backend_error("delete_by_tag", &e.to_string());
                    // fall back to the keys this instance knows about
                    for (_, cache_key) in &local {
                        if let Ok(true) = self.backend.delete(&self.config.namespace, cache_key).await {
                            affected += 1;
                        }
                    }
                }
            }

            for (request_key, cache_key) in &local {
                self.forget(request_key, cache_key);
            }
        }

        let patterns = tags.iter().map(|t| format!("tag:{}", t)).collect();
        self.finish_invalidation(patterns, affected, started);
        affected
    }

    /// Register a named smart-invalidation rule, replacing any rule with the same name
    pub fn register_rule(&self, name: impl Into<String>, rule: InvalidationRule) {
        let name = name.into();
        debug!("Registered response invalidation rule '{}'", name);
        self.rules.write().insert(name, rule);
    }

    /// Remove a named rule
    pub fn unregister_rule(&self, name: &str) -> bool {
        self.rules.write().remove(name).is_some()
    }

    /// Names of registered rules
    pub fn rule_names(&self) -> Vec<String> {
        self.rules.read().keys().cloned().collect()
    }

    /// Evaluate every rule against every tracked request key and invalidate the matches
    pub async fn handle_data_change(&self, event: &Value) -> usize {
        if !self.config.enable_smart_invalidation {
            return 0;
        }

        let started = Instant::now();
        let rules: Vec<(String, InvalidationRule)> = self
            .rules
            .read()
            .iter()
            .map(|(name, rule)| (name.clone(), rule.clone()))
            .collect();
        if rules.is_empty() {
            return 0;
        }

        let request_keys: Vec<String> = self.index.iter().map(|e| e.key().clone()).collect();
        let mut affected = 0;
        let mut matched_rules = BTreeSet::new();

        for request_key in request_keys {
            let matched: Vec<&String> = rules
                .iter()
                .filter(|(_, rule)| rule(&request_key, event))
                .map(|(name, _)| name)
                .collect();
            if matched.is_empty() {
                continue;
            }
            matched_rules.extend(matched.into_iter().cloned());
            affected += self.invalidate_request_key(&request_key).await;
        }

        if affected > 0 {
            info!(
                "Data change invalidated {} responses via rules {:?}",
                affected, matched_rules
            );
        }
        let patterns = matched_rules
            .into_iter()
            .map(|name| format!("rule:{}", name))
            .collect();
        self.finish_invalidation(patterns, affected, started);
        affected
    }

    /// Build the response served for a cached entry
    pub fn render(&self, entry: &CacheEntry, cache_status: &'static str) -> Option<ApiResponse> {
        let body = match entry.decoded_data() {
            Ok(body) => body,
            Err(e) => {
                warn!("Cached response body could not be decoded: {}", e);
                return None;
            }
        };

        let status = entry
            .status
            .and_then(|s| StatusCode::from_u16(s).ok())
            .unwrap_or(StatusCode::OK);
        let mut headers = self.validator_headers(entry);
        for (name, value) in &entry.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        headers.insert("x-cache", HeaderValue::from_static(cache_status));

        Some(ApiResponse::new(status, headers, body))
    }

    /// Build the not-modified response for a cached entry
    pub fn render_not_modified(&self, entry: &CacheEntry) -> ApiResponse {
        let mut response = ApiResponse::not_modified();
        response.headers = self.validator_headers(entry);
        response
            .headers
            .insert("x-cache", HeaderValue::from_static("HIT"));
        response
    }

    /// Drop index entries whose backend entry has expired or been evicted.
    /// Returns how many cache keys were dropped.
    pub async fn prune_index(&self) -> usize {
        let tracked: Vec<(String, String)> = self
            .index
            .iter()
            .flat_map(|entry| {
                let request_key = entry.key().clone();
                entry
                    .value()
                    .keys()
                    .map(|cache_key| (request_key.clone(), cache_key.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut pruned = 0;
        for (request_key, cache_key) in tracked {
            match self.backend.ttl(&self.config.namespace, &cache_key).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    self.forget(&request_key, &cache_key);
                    pruned += 1;
                }
                Err(e) => {
                    self.report_backend_error("ttl", &e.to_string());
                    break;
                }
            }
        }

        if pruned > 0 {
            debug!("Pruned {} expired responses from the request index", pruned);
        }
        pruned
    }

    /// Number of tracked request identities
    pub fn tracked_requests(&self) -> usize {
        self.index.len()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> ResponseCacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let not_modified = self.counters.not_modified.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let served = hits + not_modified;
        let total = served + misses;

        ResponseCacheStats {
            hits,
            misses,
            not_modified,
            sets: self.counters.sets.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            invalidated_keys: self.counters.invalidated_keys.load(Ordering::Relaxed),
            tracked_requests: self.index.len(),
            hit_ratio: if total > 0 {
                served as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    fn derive_keys(&self, request: &IncomingRequest) -> Option<(String, String)> {
        let request_key = self.keys.request_key(request);
        let cache_key = self.keys.response_key(request);
        match (request_key, cache_key) {
            (Ok(request_key), Ok(cache_key)) => Some((request_key, cache_key)),
            (Err(e), _) | (_, Err(e)) => {
                debug!("Request is not cacheable: {}", e);
                None
            }
        }
    }

    async fn invalidate_request_key(&self, request_key: &str) -> usize {
        let cache_keys: Vec<String> = match self.index.remove(request_key) {
            Some((_, entries)) => entries.into_keys().collect(),
            None => return 0,
        };

        let mut affected = 0;
        for cache_key in cache_keys {
            match self.backend.delete(&self.config.namespace, &cache_key).await {
                Ok(true) => affected += 1,
                Ok(false) => debug!("Response entry {} was already gone", cache_key),
                Err(e) => self.report_backend_error("delete", &e.to_string()),
            }
        }
        affected
    }

    fn forget(&self, request_key: &str, cache_key: &str) {
        let now_empty = match self.index.get_mut(request_key) {
            Some(mut entries) => {
                entries.remove(cache_key);
                entries.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.index.remove_if(request_key, |_, entries| entries.is_empty());
        }
    }

    fn finish_invalidation(&self, patterns: Vec<String>, affected: usize, started: Instant) {
        self.counters
            .invalidated_keys
            .fetch_add(affected as u64, Ordering::Relaxed);
        self.metrics
            .record_invalidation("response", affected, started.elapsed());
        self.events.emit(CacheEvent::ResponsesInvalidated {
            operation_id: new_operation_id(),
            patterns,
            affected_keys: affected,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    fn record_miss(&self, cache_key: &str, started: Instant) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_miss(CACHE_LABEL);
        self.events.emit(CacheEvent::CacheMiss {
            operation_id: new_operation_id(),
            cache: CACHE_LABEL.to_string(),
            key: cache_key.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    fn report_backend_error(&self, operation: &str, message: &str) {
        warn!("Response cache {} failed: {}", operation, message);
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_backend_error(operation);
        self.events.emit(CacheEvent::error(operation, message));
    }

    fn tags_for(
        &self,
        request: &IncomingRequest,
        status: StatusCode,
        extra: &[String],
    ) -> BTreeSet<String> {
        let mut tags: BTreeSet<String> = request
            .path()
            .split('/')
            .filter(|segment| !segment.is_empty())
            .filter(|segment| !segment.chars().all(|c| c.is_ascii_digit()))
            .map(|segment| format!("path:{}", segment.to_ascii_lowercase()))
            .collect();
        tags.insert(format!(
            "method:{}",
            request.method.as_str().to_ascii_lowercase()
        ));
        tags.insert(format!("status:{}xx", status.as_u16() / 100));
        tags.extend(extra.iter().cloned());
        tags
    }

    fn cacheable_headers(&self, headers: &HeaderMap) -> BTreeMap<String, String> {
        self.config
            .cacheable_headers
            .iter()
            .filter_map(|name| {
                headers
                    .get(name.as_str())
                    .and_then(|value| value.to_str().ok())
                    .map(|value| (name.to_ascii_lowercase(), value.to_string()))
            })
            .collect()
    }

    fn validator_headers(&self, entry: &CacheEntry) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(etag) = HeaderValue::from_str(&entry.etag) {
            headers.insert("etag", etag);
        }
        if let Ok(last_modified) = HeaderValue::from_str(&entry.last_modified) {
            headers.insert("last-modified", last_modified);
        }
        if let Ok(cache_control) =
            HeaderValue::from_str(&format!("max-age={}", entry.remaining_ttl().as_secs()))
        {
            headers.insert("cache-control", cache_control);
        }
        headers
    }
}

/// Whether the request's validators match the entry. `If-None-Match` takes precedence over
/// `If-Modified-Since` when both are sent.
pub fn is_not_modified(request: &IncomingRequest, entry: &CacheEntry) -> bool {
    if let Some(if_none_match) = request.header("if-none-match") {
        return if_none_match
            .split(',')
            .map(str::trim)
            .any(|tag| tag == "*" || tag.trim_start_matches("W/") == entry.etag);
    }

    if let Some(if_modified_since) = request.header("if-modified-since") {
        if let (Some(since), Some(modified)) =
            (parse_http_date(if_modified_since), entry.last_modified_time())
        {
            return since >= modified;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::stores::{InMemoryBackend, InMemoryBackendConfig};

    fn create_test_cache() -> ResponseCache {
        let backend = Arc::new(InMemoryBackend::new(InMemoryBackendConfig::default()));
        ResponseCache::new(ResponseCacheConfig::default(), backend, EventBus::default())
    }

    fn create_test_request(method: Method, uri: &str) -> IncomingRequest {
        IncomingRequest::new(
            method,
            uri.parse().unwrap(),
            HeaderMap::new(),
            Vec::new(),
            "127.0.0.1:8080".parse().unwrap(),
        )
    }

    fn json_response(body: &str) -> ApiResponse {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("set-cookie", HeaderValue::from_static("session=secret"));
        ApiResponse::new(StatusCode::OK, headers, body.as_bytes().to_vec())
    }

    #[test]
    fn test_ttl_classes() {
        let cache = create_test_cache();
        assert_eq!(
            cache.calculate_optimal_ttl(&Method::GET, "/static/app.css"),
            Duration::from_secs(86400)
        );
        assert_eq!(
            cache.calculate_optimal_ttl(&Method::GET, "/img/logo.png"),
            Duration::from_secs(86400)
        );
        assert_eq!(
            cache.calculate_optimal_ttl(&Method::GET, "/api/users/42"),
            Duration::from_secs(900)
        );
        assert_eq!(
            cache.calculate_optimal_ttl(&Method::GET, "/api/public/products"),
            Duration::from_secs(3600)
        );
        assert_eq!(
            cache.calculate_optimal_ttl(&Method::POST, "/api/public/products"),
            Duration::from_secs(300)
        );
        assert_eq!(
            cache.calculate_optimal_ttl(&Method::GET, "/health"),
            Duration::from_secs(3600)
        );
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let cache = create_test_cache();
        let request = create_test_request(Method::GET, "/api/public/products");

        assert!(matches!(cache.get(&request).await, ResponseLookup::Miss));
        assert!(
            cache
                .set(&request, &json_response("[1,2,3]"), &ResponseCacheOptions::default())
                .await
        );

        match cache.get(&request).await {
            ResponseLookup::Hit(entry) => {
                assert_eq!(entry.ttl, 3600);
                assert_eq!(entry.status, Some(200));
                assert_eq!(entry.decoded_data().unwrap(), b"[1,2,3]");
                assert!(entry.headers.contains_key("content-type"));
                assert!(!entry.headers.contains_key("set-cookie"));
                assert!(entry.tags.contains("path:products"));
                assert!(entry.tags.contains("status:2xx"));
            }
            other => panic!("expected hit, got {:?}", other),
        }

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
    }

    #[tokio::test]
    async fn test_conditional_requests() {
        let cache = create_test_cache();
        let request = create_test_request(Method::GET, "/api/public/products");
        cache
            .set(&request, &json_response("[1]"), &ResponseCacheOptions::default())
            .await;

        let etag = match cache.get(&request).await {
            ResponseLookup::Hit(entry) => entry.etag,
            other => panic!("expected hit, got {:?}", other),
        };

        let mut conditional = create_test_request(Method::GET, "/api/public/products");
        conditional
            .headers
            .insert("if-none-match", HeaderValue::from_str(&etag).unwrap());
        assert!(matches!(
            cache.get(&conditional).await,
            ResponseLookup::NotModified(_)
        ));

        let mut mismatched = create_test_request(Method::GET, "/api/public/products");
        mismatched
            .headers
            .insert("if-none-match", HeaderValue::from_static("\"other\""));
        assert!(matches!(cache.get(&mismatched).await, ResponseLookup::Hit(_)));

        let mut since = create_test_request(Method::GET, "/api/public/products");
        since.headers.insert(
            "if-modified-since",
            HeaderValue::from_static("Fri, 01 Jan 2100 00:00:00 GMT"),
        );
        assert!(matches!(
            cache.get(&since).await,
            ResponseLookup::NotModified(_)
        ));
    }

    #[tokio::test]
    async fn test_oversized_response_is_not_cached() {
        let backend = Arc::new(InMemoryBackend::new(InMemoryBackendConfig::default()));
        let cache = ResponseCache::new(
            ResponseCacheConfig {
                max_entry_size: 4,
                ..Default::default()
            },
            backend,
            EventBus::default(),
        );
        let request = create_test_request(Method::GET, "/api/items");
        assert!(
            !cache
                .set(&request, &json_response("too large"), &ResponseCacheOptions::default())
                .await
        );
    }

    #[tokio::test]
    async fn test_pattern_invalidation_purges_index() {
        let cache = create_test_cache();
        let users = create_test_request(Method::GET, "/api/users/1");
        let orders = create_test_request(Method::GET, "/api/orders?page=1");
        let options = ResponseCacheOptions::default();

        cache.set(&users, &json_response("{}"), &options).await;
        cache.set(&orders, &json_response("[]"), &options).await;
        assert_eq!(cache.tracked_requests(), 2);

        assert_eq!(cache.invalidate_endpoint("/api/orders").await, 1);
        assert_eq!(cache.tracked_requests(), 1);
        assert!(matches!(cache.get(&orders).await, ResponseLookup::Miss));
        assert!(matches!(cache.get(&users).await, ResponseLookup::Hit(_)));

        // idempotent
        assert_eq!(cache.invalidate_endpoint("/api/orders").await, 0);
    }

    #[tokio::test]
    async fn test_invalidation_counts_only_entries_still_present() {
        use crate::caching::stores::CacheBackend;

        let backend = Arc::new(InMemoryBackend::new(InMemoryBackendConfig::default()));
        let cache = ResponseCache::new(ResponseCacheConfig::default(), backend.clone(), EventBus::default());
        let live = create_test_request(Method::GET, "/api/orders/1");
        let evicted = create_test_request(Method::GET, "/api/orders/2");
        let options = ResponseCacheOptions::default();

        cache.set(&live, &json_response("{}"), &options).await;
        cache.set(&evicted, &json_response("{}"), &options).await;
        let evicted_key = cache.key_generator().response_key(&evicted).unwrap();
        assert!(backend.delete(&cache.config().namespace, &evicted_key).await.unwrap());

        assert_eq!(cache.invalidate_endpoint("/api/orders").await, 1);
        assert_eq!(cache.tracked_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_index_drops_expired_entries() {
        let cache = create_test_cache();
        let short = create_test_request(Method::GET, "/api/quotes");
        let long = create_test_request(Method::GET, "/api/catalog");

        let ttl = |secs| ResponseCacheOptions {
            ttl: Some(Duration::from_secs(secs)),
            ..Default::default()
        };
        cache.set(&short, &json_response("[]"), &ttl(10)).await;
        cache.set(&long, &json_response("[]"), &ttl(600)).await;
        assert_eq!(cache.tracked_requests(), 2);

        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(cache.prune_index().await, 1);
        assert_eq!(cache.tracked_requests(), 1);
        assert_eq!(cache.prune_index().await, 0);
        assert!(matches!(cache.get(&long).await, ResponseLookup::Hit(_)));
    }

    #[tokio::test]
    async fn test_tag_invalidation() {
        let cache = create_test_cache();
        let a = create_test_request(Method::GET, "/api/products/1");
        let b = create_test_request(Method::GET, "/api/products?sort=price");
        let c = create_test_request(Method::GET, "/api/orders");
        let options = ResponseCacheOptions::default();

        cache.set(&a, &json_response("{}"), &options).await;
        cache.set(&b, &json_response("[]"), &options).await;
        cache.set(&c, &json_response("[]"), &options).await;

        assert_eq!(
            cache
                .invalidate_by_tags(&["path:products".to_string()])
                .await,
            2
        );
        assert_eq!(cache.tracked_requests(), 1);
        assert!(matches!(cache.get(&c).await, ResponseLookup::Hit(_)));
    }

    #[tokio::test]
    async fn test_rule_based_invalidation() {
        let cache = create_test_cache();
        let options = ResponseCacheOptions::default();
        let profile = create_test_request(Method::GET, "/api/profile/7");
        let catalog = create_test_request(Method::GET, "/api/catalog");

        cache.set(&profile, &json_response("{}"), &options).await;
        cache.set(&catalog, &json_response("[]"), &options).await;

        cache.register_rule(
            "user-updates",
            Arc::new(|key: &str, event: &Value| {
                event["type"] == "user_updated" && (key.contains("user") || key.contains("profile"))
            }),
        );

        let unrelated = serde_json::json!({ "type": "order_created" });
        assert_eq!(cache.handle_data_change(&unrelated).await, 0);

        let event = serde_json::json!({ "type": "user_updated", "id": 7 });
        assert_eq!(cache.handle_data_change(&event).await, 1);
        assert!(matches!(cache.get(&profile).await, ResponseLookup::Miss));
        assert!(matches!(cache.get(&catalog).await, ResponseLookup::Hit(_)));
    }

    #[tokio::test]
    async fn test_render_sets_cache_headers() {
        let cache = create_test_cache();
        let request = create_test_request(Method::GET, "/api/public/products");
        cache
            .set(&request, &json_response("[1]"), &ResponseCacheOptions::default())
            .await;

        let entry = match cache.get(&request).await {
            ResponseLookup::Hit(entry) => entry,
            other => panic!("expected hit, got {:?}", other),
        };
        let response = cache.render(&entry, "HIT").unwrap();
        assert_eq!(response.header("x-cache"), Some("HIT"));
        assert_eq!(response.header("etag"), Some(entry.etag.as_str()));
        assert!(response.header("last-modified").is_some());
        assert!(response.header("cache-control").unwrap().starts_with("max-age="));
        assert_eq!(response.body.as_ref(), b"[1]");
    }
}
