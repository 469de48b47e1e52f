//! # Database Cache Middleware
//!
//! [`CachedConnection`] wraps a database connection so reads go through the [`QueryCache`] and
//! writes invalidate the tables they touch.
//!
//! Every statement is analyzed first. Mutating statements run directly and then invalidate
//! their tables through the invalidator (batched when batching is enabled). Reads the analyzer
//! rejects (too cheap, too many parameters, too many rows or non-deterministic) run directly
//! as well. Everything else is served from the cache.
//!
//! The wrapper keeps per-query performance figures and drops them when invalidation events
//! report the key as gone.

use crate::caching::events::{CacheEvent, EventBus};
use crate::caching::invalidation::InvalidationRequest;
use crate::caching::query_analyzer::{CacheabilityLimits, QueryAnalysis};
use crate::caching::query_cache::{QueryCache, QueryExecutor, QueryOptions, QueryOutcome};
use crate::caching::now_millis;
use crate::core::error::EngineResult;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Database middleware configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseCacheConfig {
    /// Serve reads from the cache
    pub enabled: bool,

    /// Reads estimated faster than this run directly
    pub min_execution_time_ms: u64,

    /// Reads with more parameters run directly
    pub max_params: usize,

    /// Reads estimated to return more rows run directly
    pub max_estimated_rows: u64,

    /// Invalidate the written tables after a mutating statement
    pub invalidate_on_write: bool,

    /// Follow dependent keys and derived tables when invalidating after a write
    pub cascade_on_write: bool,
}

impl Default for DatabaseCacheConfig {
    fn default() -> Self {
        let limits = CacheabilityLimits::default();
        Self {
            enabled: true,
            min_execution_time_ms: limits.min_execution_time_ms,
            max_params: limits.max_params,
            max_estimated_rows: limits.max_estimated_rows,
            invalidate_on_write: true,
            cascade_on_write: true,
        }
    }
}

impl DatabaseCacheConfig {
    pub fn limits(&self) -> CacheabilityLimits {
        CacheabilityLimits {
            min_execution_time_ms: self.min_execution_time_ms,
            max_params: self.max_params,
            max_estimated_rows: self.max_estimated_rows,
        }
    }
}

/// Observed performance of one cached query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryPerformance {
    pub executions: u64,
    pub cache_hits: u64,
    pub total_time_ms: u64,
    pub last_seen: u64,
}

impl QueryPerformance {
    pub fn average_time_ms(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.total_time_ms as f64 / self.executions as f64
        }
    }

    pub fn hit_rate(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.executions as f64
        }
    }
}

/// Caching wrapper around a database connection
pub struct CachedConnection {
    config: DatabaseCacheConfig,
    limits: CacheabilityLimits,
    connection: Arc<dyn QueryExecutor>,
    cache: Arc<QueryCache>,
    performance: Arc<DashMap<String, QueryPerformance>>,
    shutdown: CancellationToken,
    listener: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl CachedConnection {
    /// Wrap a connection. Must be called inside a Tokio runtime when `events` should prune
    /// performance figures; without one the figures are only pruned on explicit calls.
    pub fn new(
        config: DatabaseCacheConfig,
        connection: Arc<dyn QueryExecutor>,
        cache: Arc<QueryCache>,
        events: &EventBus,
    ) -> Self {
        let performance = Arc::new(DashMap::new());
        let shutdown = CancellationToken::new();

        let listener = tokio::runtime::Handle::try_current().ok().map(|handle| {
            handle.spawn(prune_on_invalidation(
                events.subscribe(),
                performance.clone(),
                cache.clone(),
                shutdown.clone(),
            ))
        });

        Self {
            limits: config.limits(),
            config,
            connection,
            cache,
            performance,
            shutdown,
            listener: parking_lot::Mutex::new(listener),
        }
    }

    pub fn config(&self) -> &DatabaseCacheConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// Run a statement, serving cacheable reads from the cache
    pub async fn query(&self, sql: &str, params: &[Value]) -> EngineResult<QueryOutcome> {
        self.query_with(sql, params, &QueryOptions::default()).await
    }

    /// Run a statement with explicit cache options
    pub async fn query_with(
        &self,
        sql: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> EngineResult<QueryOutcome> {
        let analysis = self
            .cache
            .analyzer()
            .analyze_with_params(sql, params.len());

        if analysis.is_mutating {
            return self.execute_write(sql, params, &analysis).await;
        }

        let bypass = !self.config.enabled
            || match self.cache.analyzer().non_cacheable_reason(&analysis, &self.limits) {
                Some(reason) => {
                    debug!("Executing read directly: {}", reason);
                    true
                }
                None => false,
            };

        let outcome = if bypass {
            self.cache
                .execute(sql, params, &QueryOptions::bypass(), self.connection.as_ref())
                .await?
        } else {
            self.cache
                .execute(sql, params, options, self.connection.as_ref())
                .await?
        };

        if let Some(key) = &outcome.cache_key {
            self.record_performance(key, &outcome);
        }
        Ok(outcome)
    }

    /// Performance figures for one cache key
    pub fn performance(&self, key: &str) -> Option<QueryPerformance> {
        self.performance.get(key).map(|p| p.clone())
    }

    /// Performance figures for every tracked key
    pub fn performance_snapshot(&self) -> Vec<(String, QueryPerformance)> {
        self.performance
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Stop the event listener
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let listener = self.listener.lock().take();
        if let Some(handle) = listener {
            if let Err(e) = handle.await {
                warn!("Query performance listener ended abnormally: {}", e);
            }
        }
    }

    async fn execute_write(
        &self,
        sql: &str,
        params: &[Value],
        analysis: &QueryAnalysis,
    ) -> EngineResult<QueryOutcome> {
        let started = Instant::now();
        let rows = self.connection.execute(sql, params).await?;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        if self.config.invalidate_on_write && !analysis.tables.is_empty() {
            let tables: Vec<String> = analysis.tables.iter().cloned().collect();
            debug!(
                "{:?} statement touched {:?}, invalidating",
                analysis.statement_type, tables
            );

            let reports = self
                .cache
                .invalidator()
                .submit(InvalidationRequest::Table {
                    tables,
                    cascade: self.config.cascade_on_write,
                })
                .await;

            for report in &reports {
                self.forget(&report.affected_keys);
            }
        }

        Ok(QueryOutcome {
            rows,
            cache_hit: false,
            shared: false,
            cache_key: None,
            execution_time_ms,
            ttl: None,
        })
    }

    fn record_performance(&self, key: &str, outcome: &QueryOutcome) {
        let mut perf = self.performance.entry(key.to_string()).or_default();
        perf.executions += 1;
        if outcome.cache_hit {
            perf.cache_hits += 1;
        }
        perf.total_time_ms += outcome.execution_time_ms;
        perf.last_seen = now_millis();
    }

    fn forget(&self, keys: &[String]) {
        for key in keys {
            self.performance.remove(key);
        }
        self.cache.forget_stats(keys);
    }
}

impl Drop for CachedConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn prune_on_invalidation(
    mut events: tokio::sync::broadcast::Receiver<CacheEvent>,
    performance: Arc<DashMap<String, QueryPerformance>>,
    cache: Arc<QueryCache>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(CacheEvent::TableInvalidated { keys, .. })
            | Ok(CacheEvent::DataInvalidated { keys, .. })
            | Ok(CacheEvent::SmartInvalidationCompleted { keys, .. }) => {
                for key in &keys {
                    performance.remove(key);
                }
                cache.forget_stats(&keys);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("Database cache listener lagged, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::invalidation::{InvalidationConfig, QueryInvalidator};
    use crate::caching::query_analyzer::QueryAnalyzer;
    use crate::caching::query_cache::QueryCacheConfig;
    use crate::caching::stores::{InMemoryBackend, InMemoryBackendConfig};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const JOIN_QUERY: &str = "SELECT o.id, c.name FROM orders o JOIN customers c ON c.id = o.customer_id WHERE c.region = ?";

    struct FakeDatabase {
        calls: AtomicUsize,
    }

    impl FakeDatabase {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl QueryExecutor for FakeDatabase {
        async fn execute(&self, sql: &str, _params: &[Value]) -> EngineResult<Option<Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if sql.trim_start().to_ascii_uppercase().starts_with("SELECT") {
                Ok(Some(json!([{"id": 1, "name": "Ada"}])))
            } else {
                Ok(Some(json!({"rows_affected": 1})))
            }
        }
    }

    fn create_test_connection(config: DatabaseCacheConfig) -> (CachedConnection, Arc<FakeDatabase>, EventBus) {
        let backend = Arc::new(InMemoryBackend::new(InMemoryBackendConfig::default()));
        let events = EventBus::default();
        let invalidator = QueryInvalidator::new(
            InvalidationConfig::default(),
            backend.clone(),
            events.clone(),
        );
        let cache = Arc::new(QueryCache::new(
            QueryCacheConfig::default(),
            backend,
            QueryAnalyzer::default(),
            invalidator,
            events.clone(),
        ));
        let database = Arc::new(FakeDatabase {
            calls: AtomicUsize::new(0),
        });
        let connection = CachedConnection::new(config, database.clone(), cache, &events);
        (connection, database, events)
    }

    #[tokio::test]
    async fn test_cacheable_read_is_served_from_cache() {
        let (connection, database, _events) = create_test_connection(DatabaseCacheConfig::default());
        let params = vec![json!("eu")];

        let first = connection.query(JOIN_QUERY, &params).await.unwrap();
        let second = connection.query(JOIN_QUERY, &params).await.unwrap();

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(first.rows, second.rows);
        assert_eq!(database.calls(), 1);

        let key = second.cache_key.unwrap();
        let perf = connection.performance(&key).unwrap();
        assert_eq!(perf.executions, 2);
        assert_eq!(perf.cache_hits, 1);
        assert_eq!(perf.hit_rate(), 0.5);
    }

    #[tokio::test]
    async fn test_cheap_read_runs_directly() {
        let (connection, database, _events) = create_test_connection(DatabaseCacheConfig::default());
        let sql = "SELECT * FROM orders WHERE id = ?";

        let outcome = connection.query(sql, &[json!(7)]).await.unwrap();
        connection.query(sql, &[json!(7)]).await.unwrap();

        assert!(outcome.cache_key.is_none());
        assert_eq!(database.calls(), 2);
    }

    #[tokio::test]
    async fn test_disabled_cache_runs_everything_directly() {
        let (connection, database, _events) = create_test_connection(DatabaseCacheConfig {
            enabled: false,
            ..Default::default()
        });

        connection.query(JOIN_QUERY, &[json!("eu")]).await.unwrap();
        connection.query(JOIN_QUERY, &[json!("eu")]).await.unwrap();
        assert_eq!(database.calls(), 2);
    }

    #[tokio::test]
    async fn test_write_invalidates_dependent_reads() {
        let (connection, database, _events) = create_test_connection(DatabaseCacheConfig::default());
        let params = vec![json!("eu")];

        let cached = connection.query(JOIN_QUERY, &params).await.unwrap();
        let key = cached.cache_key.clone().unwrap();
        assert!(connection.cache().invalidator().is_tracked(&key));

        let write = connection
            .query("INSERT INTO orders (customer_id) VALUES (?)", &[json!(1)])
            .await
            .unwrap();
        assert!(!write.cache_hit);
        assert!(connection.performance(&key).is_none());
        assert!(!connection.cache().invalidator().is_tracked(&key));

        let after = connection.query(JOIN_QUERY, &params).await.unwrap();
        assert!(!after.cache_hit);
        assert_eq!(database.calls(), 3);
    }

    #[tokio::test]
    async fn test_external_invalidation_prunes_performance() {
        let (connection, _database, _events) = create_test_connection(DatabaseCacheConfig::default());

        let outcome = connection.query(JOIN_QUERY, &[json!("us")]).await.unwrap();
        let key = outcome.cache_key.unwrap();
        assert!(connection.performance(&key).is_some());

        connection
            .cache()
            .invalidator()
            .invalidate_table("customers", false)
            .await;

        for _ in 0..50 {
            if connection.performance(&key).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(connection.performance(&key).is_none());
        assert!(connection.cache().query_stats(&key).is_none());

        connection.shutdown().await;
    }
}
