//! # Query Cache
//!
//! Caches database query results keyed by normalized SQL and a hash of the bound parameters.
//!
//! On a miss the injected [`QueryExecutor`] runs the statement; only non-null results are
//! stored. Every stored key is registered with the [`QueryInvalidator`] against the tables the
//! statement reads, so table and identifier invalidation reach it. TTLs come from
//! [`QueryCache::get_optimal_config`]:
//! - complexity raises the TTL (joins, grouping and unions are expensive to recompute)
//! - results above `large_result_rows` are treated as volatile and get half the TTL
//! - large payloads get a shorter TTL (x0.5 above 100KB, x0.25 above 1MB)
//! - the result is clamped to `[min_ttl, max_ttl]`
//!
//! Concurrent misses for the same key share one executor call when single-flight is on.

use super::compression::CompressionPolicy;
use super::deduplication::InFlightRegistry;
use super::entry::CacheEntry;
use super::events::{new_operation_id, CacheEvent, EventBus};
use super::invalidation::{InvalidationReport, QueryInvalidator};
use super::key_generator::{normalize_sql, KeyGenerator};
use super::query_analyzer::{QueryAnalysis, QueryAnalyzer};
use super::stores::CacheBackend;
use super::now_millis;
use crate::core::error::{EngineError, EngineResult};
use crate::observability::metrics::CacheMetrics;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const CACHE_LABEL: &str = "query";

/// Query cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryCacheConfig {
    /// Backend namespace for query results
    pub namespace: String,

    /// Base TTL before complexity and size adjustments
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    /// Lower TTL bound
    #[serde(with = "humantime_serde")]
    pub min_ttl: Duration,

    /// Upper TTL bound
    #[serde(with = "humantime_serde")]
    pub max_ttl: Duration,

    /// Row count above which a result is considered volatile
    pub large_result_rows: usize,

    /// Serialized results larger than this are not cached
    pub max_result_size: usize,

    /// Compress large results
    pub enable_compression: bool,

    /// Minimum size before compression is attempted
    pub compression_threshold: usize,

    /// Coalesce concurrent misses for the same key
    pub enable_single_flight: bool,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            namespace: "queries".to_string(),
            default_ttl: Duration::from_secs(300),
            min_ttl: Duration::from_secs(30),
            max_ttl: Duration::from_secs(3600),
            large_result_rows: 1000,
            max_result_size: 10 * 1024 * 1024,
            enable_compression: true,
            compression_threshold: 1024,
            enable_single_flight: true,
        }
    }
}

/// Executes a statement after a cache miss
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Run the statement; `None` (or a JSON null) means "no result"
    async fn execute(&self, sql: &str, params: &[Value]) -> EngineResult<Option<Value>>;
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Explicit TTL, overriding the computed one
    pub ttl: Option<Duration>,

    /// Extra backend tags
    pub tags: Vec<String>,

    /// Skip the cache and run the statement directly
    pub bypass_cache: bool,

    /// Tables to register instead of the extracted ones
    pub tables: Vec<String>,

    /// Cache keys this result is derived from
    pub depends_on: Vec<String>,

    /// Values distinguishing otherwise identical statements (tenant, locale)
    pub key_context: Value,
}

impl QueryOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn bypass() -> Self {
        Self {
            bypass_cache: true,
            ..Default::default()
        }
    }
}

/// Result of [`QueryCache::execute`]
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    /// Result rows, `None` when the executor returned nothing
    pub rows: Option<Value>,

    /// Served from the cache
    pub cache_hit: bool,

    /// Received from a concurrent caller's execution
    pub shared: bool,

    /// Cache key, `None` when key derivation failed or the cache was bypassed
    pub cache_key: Option<String>,

    /// Executor time for misses, lookup time for hits
    pub execution_time_ms: u64,

    /// TTL the result was stored with, or the remaining TTL on a hit
    pub ttl: Option<Duration>,
}

/// Storage decision for a result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryCachePlan {
    pub ttl: Duration,
    pub compress: bool,
}

/// Statistics tracked per cached query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryStats {
    /// Normalized statement
    pub sql: String,
    pub executions: u64,
    pub hits: u64,
    pub average_execution_ms: f64,
    /// Milliseconds since the epoch
    pub last_executed: u64,
    pub tables: Vec<String>,
}

/// Aggregate cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub errors: u64,
    pub shared: u64,
    pub hit_ratio: f64,
    pub tracked_queries: usize,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    errors: AtomicU64,
    shared: AtomicU64,
}

/// Executor output shared between coalesced callers
#[derive(Debug, Clone)]
struct Loaded {
    rows: Option<Value>,
    execution_time_ms: u64,
    ttl: Option<Duration>,
}

/// Query result cache
pub struct QueryCache {
    config: QueryCacheConfig,
    backend: Arc<dyn CacheBackend>,
    keys: KeyGenerator,
    analyzer: QueryAnalyzer,
    invalidator: Arc<QueryInvalidator>,
    compression: Option<CompressionPolicy>,
    flights: InFlightRegistry<Loaded>,

    /// Cache key → statistics
    query_stats: DashMap<String, QueryStats>,

    events: EventBus,
    metrics: CacheMetrics,
    counters: Counters,
}

impl QueryCache {
    /// Create a query cache sharing the invalidator's dependency graph
    pub fn new(
        config: QueryCacheConfig,
        backend: Arc<dyn CacheBackend>,
        analyzer: QueryAnalyzer,
        invalidator: Arc<QueryInvalidator>,
        events: EventBus,
    ) -> Self {
        let compression = config.enable_compression.then(|| CompressionPolicy {
            threshold: config.compression_threshold,
            ..Default::default()
        });

        Self {
            config,
            backend,
            keys: KeyGenerator::default(),
            analyzer,
            invalidator,
            compression,
            flights: InFlightRegistry::new(),
            query_stats: DashMap::new(),
            events,
            metrics: CacheMetrics,
            counters: Counters::default(),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &QueryCacheConfig {
        &self.config
    }

    /// Analyzer in use
    pub fn analyzer(&self) -> &QueryAnalyzer {
        &self.analyzer
    }

    /// Invalidator owning this cache's dependency graph
    pub fn invalidator(&self) -> &Arc<QueryInvalidator> {
        &self.invalidator
    }

    /// Cache key for a statement
    pub fn cache_key(&self, sql: &str, params: &[Value], options: &QueryOptions) -> EngineResult<String> {
        self.keys.query_key(sql, params, &options.key_context)
    }

    /// Serve a statement from the cache, running it through `executor` on a miss
    pub async fn execute(
        &self,
        sql: &str,
        params: &[Value],
        options: &QueryOptions,
        executor: &dyn QueryExecutor,
    ) -> EngineResult<QueryOutcome> {
        if options.bypass_cache {
            return Self::execute_directly(sql, params, executor).await;
        }

        let key = match self.cache_key(sql, params, options) {
            Ok(key) => key,
            Err(e) => {
                debug!("Query key derivation failed, executing directly: {}", e);
                return Self::execute_directly(sql, params, executor).await;
            }
        };

        let started = Instant::now();
        if let Some(entry) = self.lookup(&key).await {
            match entry
                .decoded_data()
                .map_err(EngineError::from)
                .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).map_err(EngineError::from))
            {
                Ok(rows) => return Ok(self.record_hit(key, rows, &entry, started)),
                Err(e) => {
                    warn!("Discarding undecodable query result {}: {}", key, e);
                    self.report_backend_error("decode", &e.to_string());
                    self.discard(&key).await;
                }
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_miss(CACHE_LABEL);
        self.events.emit(CacheEvent::CacheMiss {
            operation_id: new_operation_id(),
            cache: CACHE_LABEL.to_string(),
            key: key.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        });

        let (loaded, shared) = if self.config.enable_single_flight {
            self.flights
                .execute(&key, || self.load(&key, sql, params, options, executor))
                .await?
        } else {
            (self.load(&key, sql, params, options, executor).await?, false)
        };

        if shared {
            self.counters.shared.fetch_add(1, Ordering::Relaxed);
        }

        Ok(QueryOutcome {
            rows: loaded.rows,
            cache_hit: false,
            shared,
            cache_key: Some(key),
            execution_time_ms: loaded.execution_time_ms,
            ttl: loaded.ttl,
        })
    }

    /// Storage decision for a result of `row_count` rows serialized to `size_bytes`
    pub fn get_optimal_config(
        &self,
        analysis: &QueryAnalysis,
        row_count: usize,
        size_bytes: usize,
    ) -> QueryCachePlan {
        let mut seconds =
            self.config.default_ttl.as_secs_f64() * analysis.complexity.ttl_multiplier();

        if row_count > self.config.large_result_rows {
            seconds *= 0.5;
        }

        if size_bytes > 1024 * 1024 {
            seconds *= 0.25;
        } else if size_bytes > 100 * 1024 {
            seconds *= 0.5;
        }

        let ttl = Duration::from_secs_f64(seconds)
            .clamp(self.config.min_ttl, self.config.max_ttl.max(self.config.min_ttl));

        QueryCachePlan {
            ttl,
            compress: self.compression.is_some() && size_bytes > self.config.compression_threshold,
        }
    }

    /// Pre-populate the cache. Returns how many statements were stored.
    pub async fn warm(&self, queries: &[(String, Vec<Value>)], executor: &dyn QueryExecutor) -> usize {
        let mut warmed = 0;
        for (sql, params) in queries {
            match self
                .execute(sql, params, &QueryOptions::default(), executor)
                .await
            {
                Ok(outcome) if !outcome.cache_hit && outcome.ttl.is_some() => warmed += 1,
                Ok(_) => {}
                Err(e) => warn!("Cache warm-up failed for '{}': {}", normalize_sql(sql), e),
            }
        }
        info!("Warmed query cache with {} of {} statements", warmed, queries.len());
        warmed
    }

    /// Delete every result recorded against a table
    pub async fn invalidate_table(&self, table: &str) -> InvalidationReport {
        let report = self.invalidator.invalidate_table(table, false).await;
        self.forget_stats(&report.affected_keys);
        report
    }

    /// Drop statistics for keys that are no longer cached
    pub fn forget_stats(&self, keys: &[String]) {
        for key in keys {
            self.query_stats.remove(key);
        }
    }

    /// Drop statistics for keys whose backend entry has expired or been evicted.
    /// Returns how many were dropped.
    pub async fn prune_stats(&self) -> usize {
        let keys: Vec<String> = self.query_stats.iter().map(|e| e.key().clone()).collect();
        let mut pruned = 0;

        for key in keys {
            match self.backend.ttl(&self.config.namespace, &key).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    if self.query_stats.remove(&key).is_some() {
                        pruned += 1;
                    }
                }
                Err(e) => {
                    self.report_backend_error("ttl", &e.to_string());
                    break;
                }
            }
        }

        if pruned > 0 {
            debug!("Pruned statistics for {} expired queries", pruned);
        }
        pruned
    }

    /// Statistics for one cached query
    pub fn query_stats(&self, key: &str) -> Option<QueryStats> {
        self.query_stats.get(key).map(|stats| stats.clone())
    }

    /// Statistics for every tracked query
    pub fn all_query_stats(&self) -> Vec<(String, QueryStats)> {
        self.query_stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Aggregate statistics
    pub fn stats(&self) -> QueryCacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        QueryCacheStats {
            hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            shared: self.counters.shared.load(Ordering::Relaxed),
            hit_ratio: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
            tracked_queries: self.query_stats.len(),
        }
    }

    async fn execute_directly(
        sql: &str,
        params: &[Value],
        executor: &dyn QueryExecutor,
    ) -> EngineResult<QueryOutcome> {
        let started = Instant::now();
        let rows = executor.execute(sql, params).await?;
        Ok(QueryOutcome {
            rows,
            cache_hit: false,
            shared: false,
            cache_key: None,
            execution_time_ms: started.elapsed().as_millis() as u64,
            ttl: None,
        })
    }

    async fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let bytes = match self.backend.get(&self.config.namespace, key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                // expired or evicted; its statistics go with it
                self.query_stats.remove(key);
                return None;
            }
            Err(e) => {
                self.report_backend_error("get", &e.to_string());
                return None;
            }
        };

        match CacheEntry::from_bytes(&bytes) {
            Ok(entry) if entry.is_fresh() => Some(entry),
            Ok(_) => {
                self.query_stats.remove(key);
                None
            }
            Err(e) => {
                warn!("Discarding undecodable query entry {}: {}", key, e);
                self.discard(key).await;
                None
            }
        }
    }

    async fn discard(&self, key: &str) {
        self.query_stats.remove(key);
        if let Err(e) = self.backend.delete(&self.config.namespace, key).await {
            self.report_backend_error("delete", &e.to_string());
        }
    }

    fn record_hit(&self, key: String, rows: Value, entry: &CacheEntry, started: Instant) -> QueryOutcome {
        let elapsed = started.elapsed();
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_hit(CACHE_LABEL);
        self.metrics.record_operation(CACHE_LABEL, "get", elapsed);

        if let Some(mut stats) = self.query_stats.get_mut(&key) {
            stats.hits += 1;
        }

        self.events.emit(CacheEvent::CacheHit {
            operation_id: new_operation_id(),
            cache: CACHE_LABEL.to_string(),
            key: key.clone(),
            duration_ms: elapsed.as_millis() as u64,
        });

        QueryOutcome {
            rows: Some(rows),
            cache_hit: true,
            shared: false,
            cache_key: Some(key),
            execution_time_ms: elapsed.as_millis() as u64,
            ttl: Some(entry.remaining_ttl()),
        }
    }

    async fn load(
        &self,
        key: &str,
        sql: &str,
        params: &[Value],
        options: &QueryOptions,
        executor: &dyn QueryExecutor,
    ) -> EngineResult<Loaded> {
        let started = Instant::now();
        let rows = executor.execute(sql, params).await?;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        let rows = rows.filter(|rows| !rows.is_null());
        let ttl = match &rows {
            Some(rows) => self.store(key, sql, params, rows, options).await,
            None => {
                debug!("Query returned no result, not caching {}", key);
                None
            }
        };

        if ttl.is_some() {
            self.update_stats(key, sql, execution_time_ms);
        } else {
            self.query_stats.remove(key);
        }

        Ok(Loaded {
            rows,
            execution_time_ms,
            ttl,
        })
    }

    /// Store a result and register its dependencies. Returns the TTL it was stored with.
    async fn store(
        &self,
        key: &str,
        sql: &str,
        params: &[Value],
        rows: &Value,
        options: &QueryOptions,
    ) -> Option<Duration> {
        let started = Instant::now();
        let data = match serde_json::to_vec(rows) {
            Ok(data) => data,
            Err(e) => {
                self.report_backend_error("encode", &e.to_string());
                return None;
            }
        };

        if data.len() > self.config.max_result_size {
            debug!(
                "Query result for {} is {} bytes, above the {} byte limit",
                key,
                data.len(),
                self.config.max_result_size
            );
            return None;
        }

        let analysis = self.analyzer.analyze_with_params(sql, params.len());
        let row_count = rows.as_array().map_or(1, Vec::len);
        let plan = self.get_optimal_config(&analysis, row_count, data.len());
        let ttl = options.ttl.unwrap_or(plan.ttl);
        if ttl.is_zero() {
            return None;
        }

        let tables: BTreeSet<String> = if options.tables.is_empty() {
            analysis.tables.clone()
        } else {
            options.tables.iter().map(|t| t.to_lowercase()).collect()
        };

        let mut tags: Vec<String> = tables.iter().map(|t| format!("table:{}", t)).collect();
        tags.extend(options.tags.iter().cloned());

        let mut entry = CacheEntry::new(data, ttl).with_tags(tags.iter().cloned());
        if plan.compress {
            if let Some(policy) = &self.compression {
                entry = match entry.clone().compress_with(policy) {
                    Ok(compressed) => compressed,
                    Err(e) => {
                        warn!("Compression failed for {}, storing uncompressed: {}", key, e);
                        entry
                    }
                };
            }
        }

        let bytes = match entry.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.report_backend_error("encode", &e.to_string());
                return None;
            }
        };

        match self
            .backend
            .set(&self.config.namespace, key, &bytes, ttl, &tags)
            .await
        {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                self.report_backend_error("set", &e.to_string());
                return None;
            }
        }

        let label = format!(
            "{} {}",
            normalize_sql(sql),
            serde_json::to_string(params).unwrap_or_default()
        );
        self.invalidator.register_query(key, tables.iter().cloned(), label);
        for parent in &options.depends_on {
            self.invalidator.register_key_dependency(parent, key);
        }

        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .record_operation(CACHE_LABEL, "set", started.elapsed());
        debug!(
            "Cached query {} for {:?} (tables: {:?}, compressed: {})",
            key, ttl, tables, entry.compressed
        );

        if let Some(mut stats) = self.query_stats.get_mut(key) {
            stats.tables = tables.into_iter().collect();
        } else {
            self.query_stats.insert(
                key.to_string(),
                QueryStats {
                    sql: normalize_sql(sql),
                    tables: tables.into_iter().collect(),
                    ..Default::default()
                },
            );
        }

        Some(ttl)
    }

    fn update_stats(&self, key: &str, sql: &str, execution_time_ms: u64) {
        let mut stats = self
            .query_stats
            .entry(key.to_string())
            .or_insert_with(|| QueryStats {
                sql: normalize_sql(sql),
                ..Default::default()
            });

        let executions = stats.executions as f64;
        stats.average_execution_ms =
            (stats.average_execution_ms * executions + execution_time_ms as f64) / (executions + 1.0);
        stats.executions += 1;
        stats.last_executed = now_millis();
    }

    fn report_backend_error(&self, operation: &str, message: &str) {
        warn!("Query cache {} failed: {}", operation, message);
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_backend_error(operation);
        self.events
            .emit(CacheEvent::error(&format!("query_cache.{}", operation), message));
    }
}
