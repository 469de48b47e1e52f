//! # Caching System Module
//!
//! This module provides the caching and invalidation engine: response caching with
//! conditional-request support, query result caching with table dependency tracking, a
//! dependency-graph invalidator and an integrity validator.
//!
//! ## Features
//! - Namespaced backends (in-memory and Redis) with TTL, pattern and tag deletion
//! - Content-addressed cache keys for requests and queries
//! - ETag / Last-Modified revalidation and gzip compression of large payloads
//! - Table, identifier and impact-analyzed ("smart") invalidation with bounded cascades
//! - Batched invalidation fed through a typed request channel
//! - Single-flight coalescing of concurrent misses
//! - Integrity validation, health monitoring and repair
//!
//! ## Architecture
//! 1. **Stores**: the [`CacheBackend`] trait and its implementations
//! 2. **Caches**: [`ResponseCache`] and [`QueryCache`] own key derivation, TTL policy and
//!    their in-memory indices
//! 3. **Invalidation**: [`QueryInvalidator`] owns the dependency graph
//! 4. **Validation**: [`CacheValidator`] samples and repairs stored entries
//!
//! ## Failure Policy
//! A failing backend never fails the cached operation: lookups degrade to misses, writes to
//! `false` and invalidations to reported partial results. Every such failure is logged and
//! emitted as an [`CacheEvent::Error`].

pub mod compression;
pub mod deduplication;
pub mod dependency;
pub mod entry;
pub mod events;
pub mod invalidation;
pub mod key_generator;
pub mod query_analyzer;
pub mod query_cache;
pub mod response_cache;
pub mod stores;
pub mod validator;

pub use deduplication::{Flight, FlightGuard, InFlightRegistry};
pub use dependency::{DependencyGraph, RegexTableExtractor, TableDependencyExtractor};
pub use compression::CompressionPolicy;
pub use entry::CacheEntry;
pub use events::{CacheEvent, EventBus};
pub use invalidation::{
    ChangeContext, ChangeType, ImpactAnalysis, InvalidationConfig, InvalidationKind,
    InvalidationReport, InvalidationRequest, InvalidationSender, InvalidationStats,
    InvalidationStrategy, QueryInvalidator, RiskLevel,
};
pub use key_generator::KeyGenerator;
pub use query_analyzer::{
    CacheabilityLimits, QueryAnalysis, QueryAnalyzer, QueryComplexity, StatementType,
};
pub use query_cache::{
    QueryCache, QueryCacheConfig, QueryCachePlan, QueryCacheStats, QueryExecutor, QueryOptions,
    QueryOutcome, QueryStats,
};
pub use response_cache::{
    InvalidationRule, ResponseCache, ResponseCacheConfig, ResponseCacheOptions, ResponseCacheStats,
    ResponseLookup,
};
pub use stores::{CacheBackend, CacheStoreStats, InMemoryBackend, RedisBackend};
pub use validator::{
    CacheValidator, HealthStatus, IntegrityReport, JsonType, RepairOptions, RepairReport,
    SourceLoader, TierHealth, ValidationResult, ValidationRule, ValidatorConfig,
};

use crate::core::error::EngineError;
use std::time::{SystemTime, UNIX_EPOCH};

/// Cache operation result
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific error types
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache store error: {message}")]
    Store { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Key generation error: {message}")]
    KeyGeneration { message: String },

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Invalidation error: {message}")]
    Invalidation { message: String },

    #[error("Cache configuration error: {message}")]
    Configuration { message: String },

    #[error("Cache operation timeout")]
    Timeout,

    #[error("Cache not available")]
    Unavailable,
}

impl From<CacheError> for EngineError {
    fn from(err: CacheError) -> Self {
        EngineError::Cache {
            message: err.to_string(),
        }
    }
}

/// Milliseconds since the Unix epoch
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
