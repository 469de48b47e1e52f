//! # Structured Logging
//!
//! Installs the global `tracing` subscriber for the engine binary. Library code only emits
//! through the `tracing` macros; embedding applications may install their own subscriber
//! instead of calling [`init_logging`].

use tracing::{warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::observability::config::{LogConfig, LogFormat};

/// Parse a textual level, defaulting to INFO for unknown values
fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` directives are honored on top of the configured level. Calling this more than
/// once is harmless: later calls log a warning and keep the first subscriber.
pub fn init_logging(config: &LogConfig) {
    let env_filter = EnvFilter::from_default_env().add_directive(parse_level(&config.level).into());

    let result = match config.format {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init(),
    };

    if result.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("verbose"), Level::INFO);
    }

    #[test]
    fn test_init_logging_twice_is_harmless() {
        let config = LogConfig {
            level: "debug".to_string(),
            format: LogFormat::Text,
        };
        init_logging(&config);
        init_logging(&config);
    }
}
