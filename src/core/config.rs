//! # Configuration Module
//!
//! This module handles engine configuration: the aggregate [`EngineConfig`], file loading,
//! environment overrides and validation. Each component owns its own config struct (next to
//! the component) and this module stitches them together.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde
//! - Environment variable override support (`CACHE_ENGINE_*`)
//! - Human readable durations (`"5m"`, `"24h"`) via `humantime-serde`
//! - Validation with every problem reported at once

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::caching::invalidation::InvalidationConfig;
use crate::caching::query_cache::QueryCacheConfig;
use crate::caching::response_cache::ResponseCacheConfig;
use crate::caching::stores::{InMemoryBackendConfig, RedisBackendConfig};
use crate::caching::validator::ValidatorConfig;
use crate::core::error::{EngineError, EngineResult};
use crate::middleware::api_cache::ApiCacheConfig;
use crate::middleware::database_cache::DatabaseCacheConfig;
use crate::observability::config::{LogConfig, MetricsConfig};

/// Main engine configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cache backend selection
    pub backend: BackendConfig,

    /// HTTP response caching
    pub response_cache: ResponseCacheConfig,

    /// Database query result caching
    pub query_cache: QueryCacheConfig,

    /// Dependency-graph invalidation
    pub invalidation: InvalidationConfig,

    /// Request pipeline middleware (gating + rate limiting)
    pub api_middleware: ApiCacheConfig,

    /// Database connection middleware
    pub database: DatabaseCacheConfig,

    /// Integrity validation and health monitoring
    pub validator: ValidatorConfig,

    /// Logging settings
    pub logging: LogConfig,

    /// Metrics settings
    pub metrics: MetricsConfig,
}

/// Which backend implementation the engine runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Memory,
    Redis,
}

/// Backend configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Selected backend
    pub kind: BackendKind,

    /// In-memory backend settings
    pub memory: InMemoryBackendConfig,

    /// Redis backend settings
    pub redis: RedisBackendConfig,
}

impl EngineConfig {
    /// Load configuration from a YAML (or `.json`) file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| EngineError::config(format!("Failed to read config file: {}", e)))?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let mut config: EngineConfig = if is_json {
            serde_json::from_str(&content)
                .map_err(|e| EngineError::config(format!("Failed to parse JSON config: {}", e)))?
        } else {
            serde_yaml::from_str(&content)
                .map_err(|e| EngineError::config(format!("Failed to parse config: {}", e)))?
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Variables follow the pattern `CACHE_ENGINE_<FIELD>`, for example
    /// `CACHE_ENGINE_DEFAULT_TTL=10m` or `CACHE_ENGINE_RATE_LIMIT_MAX=500`.
    pub fn apply_env_overrides(&mut self) -> EngineResult<()> {
        use std::env;

        if let Ok(ttl) = env::var("CACHE_ENGINE_DEFAULT_TTL") {
            let ttl = parse_duration_var("CACHE_ENGINE_DEFAULT_TTL", &ttl)?;
            self.response_cache.default_ttl = ttl;
            self.query_cache.default_ttl = ttl;
        }

        if let Ok(size) = env::var("CACHE_ENGINE_MAX_CACHE_SIZE") {
            let size: usize = parse_var("CACHE_ENGINE_MAX_CACHE_SIZE", &size)?;
            self.response_cache.max_entry_size = size;
            self.query_cache.max_result_size = size;
            self.validator.max_entry_size = size;
        }

        if let Ok(enabled) = env::var("CACHE_ENGINE_ENABLE_COMPRESSION") {
            let enabled: bool = parse_var("CACHE_ENGINE_ENABLE_COMPRESSION", &enabled)?;
            self.response_cache.enable_compression = enabled;
            self.query_cache.enable_compression = enabled;
        }

        if let Ok(enabled) = env::var("CACHE_ENGINE_ENABLE_SMART_INVALIDATION") {
            let enabled: bool = parse_var("CACHE_ENGINE_ENABLE_SMART_INVALIDATION", &enabled)?;
            self.response_cache.enable_smart_invalidation = enabled;
            self.invalidation.enable_smart_invalidation = enabled;
        }

        if let Ok(enabled) = env::var("CACHE_ENGINE_ENABLE_BATCH_INVALIDATION") {
            self.invalidation.enable_batch_invalidation =
                parse_var("CACHE_ENGINE_ENABLE_BATCH_INVALIDATION", &enabled)?;
        }

        if let Ok(size) = env::var("CACHE_ENGINE_BATCH_SIZE") {
            self.invalidation.batch_size = parse_var("CACHE_ENGINE_BATCH_SIZE", &size)?;
        }

        if let Ok(depth) = env::var("CACHE_ENGINE_MAX_DEPENDENCY_DEPTH") {
            self.invalidation.max_dependency_depth =
                parse_var("CACHE_ENGINE_MAX_DEPENDENCY_DEPTH", &depth)?;
        }

        if let Ok(headers) = env::var("CACHE_ENGINE_VARY_HEADERS") {
            self.response_cache.vary_headers = split_list(&headers);
        }

        if let Ok(paths) = env::var("CACHE_ENGINE_EXCLUDE_PATHS") {
            self.api_middleware.exclude_paths = split_list(&paths);
        }

        if let Ok(paths) = env::var("CACHE_ENGINE_INCLUDE_PATHS") {
            self.api_middleware.include_paths = split_list(&paths);
        }

        if let Ok(window) = env::var("CACHE_ENGINE_RATE_LIMIT_WINDOW") {
            self.api_middleware.rate_limit.window =
                parse_duration_var("CACHE_ENGINE_RATE_LIMIT_WINDOW", &window)?;
        }

        if let Ok(max) = env::var("CACHE_ENGINE_RATE_LIMIT_MAX") {
            self.api_middleware.rate_limit.max_requests =
                parse_var("CACHE_ENGINE_RATE_LIMIT_MAX", &max)?;
        }

        if let Ok(url) = env::var("CACHE_ENGINE_REDIS_URL") {
            self.backend.kind = BackendKind::Redis;
            self.backend.redis.url = url;
        }

        if let Ok(level) = env::var("CACHE_ENGINE_LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Validate the configuration, reporting every problem found
    pub fn validate(&self) -> EngineResult<()> {
        let mut errors = Vec::new();

        if self.response_cache.default_ttl.is_zero() {
            errors.push("response_cache.default_ttl must be greater than 0".to_string());
        }

        if self.query_cache.default_ttl.is_zero() {
            errors.push("query_cache.default_ttl must be greater than 0".to_string());
        }

        if self.query_cache.min_ttl > self.query_cache.max_ttl {
            errors.push("query_cache.min_ttl must not exceed query_cache.max_ttl".to_string());
        }

        if self.response_cache.namespace == self.query_cache.namespace {
            errors.push("response and query caches must use different namespaces".to_string());
        }

        if self.invalidation.namespace != self.query_cache.namespace {
            errors.push(format!(
                "invalidation.namespace '{}' must match query_cache.namespace '{}'",
                self.invalidation.namespace, self.query_cache.namespace
            ));
        }

        if self.invalidation.enable_batch_invalidation && self.invalidation.batch_size == 0 {
            errors.push("invalidation.batch_size must be greater than 0".to_string());
        }

        if self.invalidation.max_dependency_depth == 0 {
            errors.push("invalidation.max_dependency_depth must be greater than 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.invalidation.fuzzy_threshold) {
            errors.push("invalidation.fuzzy_threshold must be between 0 and 1".to_string());
        }

        if self.api_middleware.cacheable_methods.is_empty() {
            errors.push("api_middleware.cacheable_methods cannot be empty".to_string());
        }

        for method in &self.api_middleware.cacheable_methods {
            match method.to_uppercase().as_str() {
                "GET" | "HEAD" | "POST" | "PUT" | "DELETE" | "PATCH" | "OPTIONS" => {}
                _ => errors.push(format!("Invalid cacheable HTTP method: {}", method)),
            }
        }

        if self.api_middleware.rate_limit.enabled {
            if self.api_middleware.rate_limit.max_requests == 0 {
                errors.push("rate_limit.max_requests must be greater than 0".to_string());
            }
            if self.api_middleware.rate_limit.window.is_zero() {
                errors.push("rate_limit.window must be greater than 0".to_string());
            }
            if self.api_middleware.rate_limit.cleanup_interval.is_zero() {
                errors.push("rate_limit.cleanup_interval must be greater than 0".to_string());
            }
        }

        if self.validator.health_check_interval.is_zero() {
            errors.push("validator.health_check_interval must be greater than 0".to_string());
        }

        if self.validator.degraded_threshold > self.validator.healthy_threshold {
            errors.push(
                "validator.degraded_threshold must not exceed validator.healthy_threshold"
                    .to_string(),
            );
        }

        if self.backend.kind == BackendKind::Redis && self.backend.redis.url.is_empty() {
            errors.push("backend.redis.url is required for the redis backend".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::config(errors.join("; ")))
        }
    }
}

fn parse_var<T>(name: &str, value: &str) -> EngineResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| EngineError::config(format!("Invalid {}: {}", name, e)))
}

fn parse_duration_var(name: &str, value: &str) -> EngineResult<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| EngineError::config(format!("Invalid {}: {}", name, e)))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::env;
    use std::io::Write;

    // process environment is shared between test threads
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_default_config_validation() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.invalidation.max_dependency_depth, 5);
        assert_eq!(config.api_middleware.cacheable_methods, vec!["GET", "HEAD"]);
    }

    #[tokio::test]
    async fn test_load_config_from_yaml_file() {
        let _env = ENV_LOCK.lock();
        let yaml = r#"
response_cache:
  default_ttl: 1h
  vary_headers: ["accept"]
invalidation:
  enable_batch_invalidation: true
  batch_size: 25
api_middleware:
  exclude_paths: ["/auth/*"]
  rate_limit:
    window: 60s
    max_requests: 3
"#;
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = EngineConfig::load_from_file(file.path()).await.unwrap();
        assert_eq!(config.response_cache.default_ttl, Duration::from_secs(3600));
        assert_eq!(config.response_cache.vary_headers, vec!["accept"]);
        assert!(config.invalidation.enable_batch_invalidation);
        assert_eq!(config.invalidation.batch_size, 25);
        assert_eq!(config.api_middleware.rate_limit.max_requests, 3);
        // untouched sections keep their defaults
        assert_eq!(config.query_cache.namespace, "queries");
    }

    #[tokio::test]
    async fn test_load_config_from_json_file() {
        let _env = ENV_LOCK.lock();
        let json = r#"{ "query_cache": { "default_ttl": "10m" }, "backend": { "kind": "memory" } }"#;
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let config = EngineConfig::load_from_file(file.path()).await.unwrap();
        assert_eq!(config.query_cache.default_ttl, Duration::from_secs(600));
        assert_eq!(config.backend.kind, BackendKind::Memory);
    }

    #[test]
    fn test_environment_variable_overrides() {
        let _env = ENV_LOCK.lock();
        env::set_var("CACHE_ENGINE_BATCH_SIZE", "7");
        env::set_var("CACHE_ENGINE_RATE_LIMIT_WINDOW", "30s");
        env::set_var("CACHE_ENGINE_VARY_HEADERS", "accept, x-tenant");

        let mut config = EngineConfig::default();
        config.apply_env_overrides().unwrap();

        assert_eq!(config.invalidation.batch_size, 7);
        assert_eq!(config.api_middleware.rate_limit.window, Duration::from_secs(30));
        assert_eq!(config.response_cache.vary_headers, vec!["accept", "x-tenant"]);

        env::remove_var("CACHE_ENGINE_BATCH_SIZE");
        env::remove_var("CACHE_ENGINE_RATE_LIMIT_WINDOW");
        env::remove_var("CACHE_ENGINE_VARY_HEADERS");
    }

    #[test]
    fn test_invalid_environment_variables() {
        let _env = ENV_LOCK.lock();
        env::set_var("CACHE_ENGINE_MAX_DEPENDENCY_DEPTH", "deep");

        let mut config = EngineConfig::default();
        let result = config.apply_env_overrides();

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid CACHE_ENGINE_MAX_DEPENDENCY_DEPTH"));

        env::remove_var("CACHE_ENGINE_MAX_DEPENDENCY_DEPTH");
    }

    #[test]
    fn test_config_validation_errors() {
        let mut config = EngineConfig::default();
        config.invalidation.max_dependency_depth = 0;
        config.api_middleware.cacheable_methods = vec!["FETCH".to_string()];

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("max_dependency_depth"));
        assert!(message.contains("FETCH"));

        let mut config = EngineConfig::default();
        config.invalidation.namespace = "other".to_string();
        assert!(config.validate().is_err());
    }
}
