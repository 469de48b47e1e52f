//! # Error Handling Module
//!
//! This module provides the top-level error type for the cache engine using the `thiserror`
//! crate. It defines the errors that can cross the engine's public API and maps them onto HTTP
//! status codes so request middleware can turn them into client responses.
//!
//! ## Error Taxonomy
//! - Backend failures are handled inside the caching layer and never reach callers; they only
//!   show up here when a caller explicitly asks the backend for something (health checks).
//! - Key derivation failures downgrade to direct execution.
//! - Rate limit rejections are user-visible and carry `limit`/`remaining`/`reset` metadata.
//! - Downstream (handler or database) failures are propagated unchanged, because the cache
//!   layer must behave as if it were not there.

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::convert::Infallible;
use thiserror::Error;

/// Main result type used throughout the engine
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the cache engine
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Client exceeded its request budget for the current window
    #[error("Rate limit exceeded: {limit} requests per {window_secs}s")]
    RateLimitExceeded {
        limit: u32,
        remaining: u32,
        /// Unix timestamp (seconds) at which the window frees a slot
        reset_time: u64,
        window_secs: u64,
        retry_after_secs: u64,
    },

    /// Cache layer errors that were explicitly requested to propagate
    #[error("Cache error: {message}")]
    Cache { message: String },

    /// Request or query input could not be turned into a cache key
    #[error("Key derivation failed: {reason}")]
    KeyDerivation { reason: String },

    /// Integrity validation failure for a cached entry
    #[error("Validation failed for {key}: {reason}")]
    Validation { key: String, reason: String },

    /// Invalidation could not be completed
    #[error("Invalidation error: {message}")]
    Invalidation { message: String },

    /// The downstream handler or database failed
    #[error("Downstream error: {message}")]
    Downstream { message: String },

    /// Internal errors for unexpected failures
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// I/O errors (config files, sockets)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },
}

impl EngineError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a downstream error with a custom message
    pub fn downstream<S: Into<String>>(message: S) -> Self {
        Self::Downstream {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a key derivation error
    pub fn key_derivation<S: Into<String>>(reason: S) -> Self {
        Self::KeyDerivation {
            reason: reason.into(),
        }
    }

    /// Create an invalidation error with a custom message
    pub fn invalidation<S: Into<String>>(message: S) -> Self {
        Self::Invalidation {
            message: message.into(),
        }
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::KeyDerivation { .. } => StatusCode::BAD_REQUEST,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Downstream { .. } => StatusCode::BAD_GATEWAY,
            Self::Configuration { .. }
            | Self::Cache { .. }
            | Self::Validation { .. }
            | Self::Invalidation { .. }
            | Self::Internal { .. }
            | Self::Io { .. }
            | Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if the failed operation may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded { .. } | Self::Downstream { .. } | Self::Io { .. }
        )
    }

    /// Get a string representation of the error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::Cache { .. } => "cache_error",
            Self::KeyDerivation { .. } => "key_derivation_error",
            Self::Validation { .. } => "validation_error",
            Self::Invalidation { .. } => "invalidation_error",
            Self::Downstream { .. } => "downstream_error",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
        }
    }

    /// Rate limit headers for a rejection, empty for every other error
    pub fn rate_limit_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Self::RateLimitExceeded {
            limit,
            remaining,
            reset_time,
            retry_after_secs,
            ..
        } = self
        {
            headers.insert("x-ratelimit-limit", HeaderValue::from(*limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(*remaining));
            headers.insert("x-ratelimit-reset", HeaderValue::from(*reset_time));
            headers.insert("retry-after", HeaderValue::from(*retry_after_secs));
        }
        headers
    }
}

impl From<Infallible> for EngineError {
    fn from(infallible: Infallible) -> Self {
        match infallible {}
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

/// Render engine errors as structured JSON responses.
///
/// Rate limit rejections also carry the `X-RateLimit-*` and `Retry-After` headers.
impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let headers = self.rate_limit_headers();

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
                "retryable": self.is_retryable(),
            }
        });

        (status, headers, Json(error_response)).into_response()
    }
}
