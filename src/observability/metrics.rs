//! # Metrics Collection
//!
//! Thin wrappers around the `metrics` facade for the cache engine's counters and histograms.
//! Recording is a no-op until a recorder is installed; the binary installs the Prometheus
//! exporter via [`install_prometheus_exporter`].

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

use crate::core::error::{EngineError, EngineResult};
use crate::observability::config::MetricsConfig;

/// Cache metrics recorder, labelled by cache (`responses`, `queries`)
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheMetrics;

impl CacheMetrics {
    /// Record a cache hit
    pub fn record_hit(&self, cache: &str) {
        metrics::counter!("cache_hits_total", "cache" => cache.to_string()).increment(1);
    }

    /// Record a cache miss
    pub fn record_miss(&self, cache: &str) {
        metrics::counter!("cache_misses_total", "cache" => cache.to_string()).increment(1);
    }

    /// Record a conditional request answered with not-modified
    pub fn record_not_modified(&self, cache: &str) {
        metrics::counter!("cache_not_modified_total", "cache" => cache.to_string()).increment(1);
    }

    /// Record a backend failure that was degraded to a miss or no-op
    pub fn record_backend_error(&self, operation: &str) {
        metrics::counter!("cache_backend_errors_total", "operation" => operation.to_string())
            .increment(1);
    }

    /// Record an invalidation and the number of keys it removed
    pub fn record_invalidation(&self, kind: &str, affected_keys: usize, duration: Duration) {
        let kind = kind.to_string();
        metrics::counter!("cache_invalidations_total", "kind" => kind.clone()).increment(1);
        metrics::counter!("cache_invalidated_keys_total", "kind" => kind.clone())
            .increment(affected_keys as u64);
        metrics::histogram!("cache_invalidation_duration_seconds", "kind" => kind)
            .record(duration.as_secs_f64());
    }

    /// Record the duration of a cache operation
    pub fn record_operation(&self, cache: &str, operation: &str, duration: Duration) {
        metrics::histogram!(
            "cache_operation_duration_seconds",
            "cache" => cache.to_string(),
            "operation" => operation.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a rate limit rejection
    pub fn record_rate_limited(&self) {
        metrics::counter!("rate_limit_rejections_total").increment(1);
    }
}

/// Install the Prometheus exporter with an HTTP listener
pub fn install_prometheus_exporter(config: &MetricsConfig) -> EngineResult<()> {
    let addr: SocketAddr = config.listen_address.parse().map_err(|e| {
        EngineError::config(format!(
            "Invalid metrics listen address '{}': {}",
            config.listen_address, e
        ))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::internal(format!("Failed to install metrics exporter: {}", e)))?;

    info!("Prometheus exporter listening on {}", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = CacheMetrics;
        metrics.record_hit("responses");
        metrics.record_miss("queries");
        metrics.record_invalidation("table", 3, Duration::from_millis(4));
        metrics.record_rate_limited();
    }

    #[test]
    fn test_invalid_listen_address() {
        let config = MetricsConfig {
            enabled: true,
            listen_address: "not-an-address".to_string(),
        };
        assert!(install_prometheus_exporter(&config).is_err());
    }
}
