//! # Cache Engine
//!
//! Explicitly constructed facade owning every caching component and its background tasks.
//! Several engines may coexist; nothing is stored in globals.
//!
//! ```text
//!                 ┌──────────────────┐
//!   requests ───► │ ApiCacheMiddleware│──► ResponseCache ─┐
//!                 └──────────────────┘                     │
//!                 ┌──────────────────┐                     ├──► CacheBackend
//!   statements ─► │ CachedConnection │──► QueryCache ──────┤
//!                 └──────────────────┘         │           │
//!                                     QueryInvalidator ────┤
//!                                     CacheValidator ──────┘
//! ```

use crate::caching::events::EventBus;
use crate::caching::invalidation::{InvalidationReport, InvalidationSender, QueryInvalidator};
use crate::caching::query_analyzer::QueryAnalyzer;
use crate::caching::query_cache::{QueryCache, QueryExecutor};
use crate::caching::response_cache::ResponseCache;
use crate::caching::stores::{CacheBackend, InMemoryBackend, RedisBackend};
use crate::caching::validator::CacheValidator;
use crate::core::config::{BackendKind, EngineConfig};
use crate::core::error::EngineResult;
use crate::middleware::api_cache::ApiCacheMiddleware;
use crate::middleware::database_cache::CachedConnection;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of a table invalidation across both caches
#[derive(Debug, Clone)]
pub struct TableInvalidation {
    /// Query results removed through the dependency graph
    pub queries: InvalidationReport,

    /// Responses removed through their `table:<name>` tags
    pub responses: usize,
}

/// Every caching component wired over one backend
pub struct CacheEngine {
    config: EngineConfig,
    backend: Arc<dyn CacheBackend>,
    events: EventBus,
    invalidator: Arc<QueryInvalidator>,
    query_cache: Arc<QueryCache>,
    response_cache: Arc<ResponseCache>,
    validator: Arc<CacheValidator>,
    api: Arc<ApiCacheMiddleware>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheEngine {
    /// Build the engine over an existing backend and start its background tasks.
    /// Must be called inside a Tokio runtime.
    pub fn init(config: EngineConfig, backend: Arc<dyn CacheBackend>) -> EngineResult<Self> {
        config.validate()?;

        let events = EventBus::default();
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let invalidator = QueryInvalidator::new(
            config.invalidation.clone(),
            backend.clone(),
            events.clone(),
        );
        invalidator.start();

        let query_cache = Arc::new(QueryCache::new(
            config.query_cache.clone(),
            backend.clone(),
            QueryAnalyzer::default(),
            invalidator.clone(),
            events.clone(),
        ));

        let response_cache = Arc::new(ResponseCache::new(
            config.response_cache.clone(),
            backend.clone(),
            events.clone(),
        ));

        let validator = Arc::new(CacheValidator::new(
            config.validator.clone(),
            backend.clone(),
            events.clone(),
        ));
        if config.validator.enable_health_monitor {
            tasks.push(validator.clone().spawn_health_monitor(shutdown.clone()));
        }
        tasks.push(Self::spawn_bookkeeping_sweep(
            query_cache.clone(),
            response_cache.clone(),
            config.validator.health_check_interval,
            shutdown.clone(),
        ));

        let api = Arc::new(ApiCacheMiddleware::new(
            config.api_middleware.clone(),
            response_cache.clone(),
        )?);

        info!(
            "Cache engine initialized (responses: '{}', queries: '{}', batching: {})",
            config.response_cache.namespace,
            config.query_cache.namespace,
            config.invalidation.enable_batch_invalidation
        );

        Ok(Self {
            config,
            backend,
            events,
            invalidator,
            query_cache,
            response_cache,
            validator,
            api,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Build the backend named in the configuration, then the engine
    pub async fn connect(config: EngineConfig) -> EngineResult<Self> {
        let backend: Arc<dyn CacheBackend> = match config.backend.kind {
            BackendKind::Memory => Arc::new(InMemoryBackend::new(config.backend.memory.clone())),
            BackendKind::Redis => Arc::new(RedisBackend::new(config.backend.redis.clone()).await?),
        };
        Self::init(config, backend)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Event stream shared by every component
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn invalidator(&self) -> &Arc<QueryInvalidator> {
        &self.invalidator
    }

    /// Channel for submitting invalidation requests from other tasks
    pub fn invalidation_sender(&self) -> InvalidationSender {
        self.invalidator.sender()
    }

    pub fn query_cache(&self) -> &Arc<QueryCache> {
        &self.query_cache
    }

    pub fn response_cache(&self) -> &Arc<ResponseCache> {
        &self.response_cache
    }

    pub fn validator(&self) -> &Arc<CacheValidator> {
        &self.validator
    }

    pub fn api_middleware(&self) -> &Arc<ApiCacheMiddleware> {
        &self.api
    }

    /// Wrap a database connection with the query cache
    pub fn connection(&self, connection: Arc<dyn QueryExecutor>) -> CachedConnection {
        CachedConnection::new(
            self.config.database.clone(),
            connection,
            self.query_cache.clone(),
            &self.events,
        )
    }

    /// Forward a data-change notification to the response cache's rules.
    /// Returns the number of responses invalidated. Query results are not touched; use
    /// [`CacheEngine::invalidate_tables`] or the invalidation channel for those.
    pub async fn handle_data_change(&self, change: &Value) -> usize {
        self.response_cache.handle_data_change(change).await
    }

    /// Invalidate query results that read the tables, and responses tagged `table:<name>`
    /// for any of them
    pub async fn invalidate_tables(&self, tables: &[String], cascade: bool) -> TableInvalidation {
        let tables: Vec<String> = tables.iter().map(|table| table.to_lowercase()).collect();
        let queries = self.invalidator.invalidate_tables(&tables, cascade).await;
        self.query_cache.forget_stats(&queries.affected_keys);

        let tags: Vec<String> = tables.iter().map(|table| format!("table:{}", table)).collect();
        let responses = self.response_cache.invalidate_by_tags(&tags).await;

        TableInvalidation { queries, responses }
    }

    /// Periodically drop bookkeeping for entries the backend expired on its own
    fn spawn_bookkeeping_sweep(
        query_cache: Arc<QueryCache>,
        response_cache: Arc<ResponseCache>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let stats = query_cache.prune_stats().await;
                        let responses = response_cache.prune_index().await;
                        debug!(
                            "Bookkeeping sweep dropped {} query stats and {} response index entries",
                            stats, responses
                        );
                    }
                }
            }
        })
    }

    /// Flush queued invalidations and stop every background task
    pub async fn shutdown(&self) {
        info!("Shutting down cache engine");
        self.invalidator.shutdown().await;

        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!("Cache engine task ended abnormally: {}", e);
            }
        }
    }
}
