// Observability configuration
pub mod config;

// Metrics collection
pub mod metrics;

// Structured logging
pub mod logging;

// Re-export commonly used types for convenience
pub use config::{LogConfig, LogFormat, MetricsConfig};
pub use logging::init_logging;
pub use metrics::{install_prometheus_exporter, CacheMetrics};
