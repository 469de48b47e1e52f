//! # Rate Limiting
//!
//! Per-client sliding-window rate limiting for the API cache middleware.
//!
//! Each client identity owns a list of request timestamps. A request is allowed while fewer
//! than `max_requests` timestamps fall inside the trailing `window`; rejected requests are not
//! recorded. Every decision carries `limit`, `remaining` and `reset_time` (when the oldest
//! recorded request leaves the window) so callers can emit `X-RateLimit-*` headers on both
//! outcomes.
//!
//! Checks are synchronous and never wait: the per-client list is updated under the map
//! shard's lock and released before returning. A background task started with the limiter
//! drops windows that saw no request inside the trailing window.

use crate::caching::now_millis;
use crate::core::error::EngineError;
use axum::http::{HeaderMap, HeaderValue};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type ClientWindows = DashMap<String, VecDeque<u64>>;

/// Errors that can occur while configuring rate limiting
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<RateLimitError> for EngineError {
    fn from(err: RateLimitError) -> Self {
        EngineError::config(err.to_string())
    }
}

/// Configuration for rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Whether requests are rate limited at all
    pub enabled: bool,

    /// Length of the sliding window
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Requests allowed per client within the window
    pub max_requests: u32,

    /// Prefix for client keys
    pub key_prefix: String,

    /// Paths never rate limited; a trailing `*` matches any suffix
    pub exempt_paths: Vec<String>,

    /// How often idle client windows are dropped
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            max_requests: 100,
            key_prefix: "rate_limit".to_string(),
            exempt_paths: Vec::new(),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Rate limit decision result
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: SystemTime,
    pub retry_after: Option<Duration>,
}

impl RateLimitResult {
    fn unlimited(limit: u32, window: Duration) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_time: SystemTime::now() + window,
            retry_after: None,
        }
    }

    /// Reset time as seconds since the epoch
    pub fn reset_epoch_secs(&self) -> u64 {
        self.reset_time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// `X-RateLimit-*` headers, plus `Retry-After` on rejection
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(self.reset_epoch_secs()));
        if let Some(retry_after) = self.retry_after {
            headers.insert("retry-after", HeaderValue::from(retry_after.as_secs().max(1)));
        }
        headers
    }

    /// The user-visible rejection for a denied request
    pub fn to_error(&self, window: Duration) -> EngineError {
        EngineError::RateLimitExceeded {
            limit: self.limit,
            remaining: self.remaining,
            reset_time: self.reset_epoch_secs(),
            window_secs: window.as_secs(),
            retry_after_secs: self.retry_after.map(|d| d.as_secs().max(1)).unwrap_or(1),
        }
    }
}

/// Rate limiting metrics
#[derive(Debug, Default)]
pub struct RateLimitMetrics {
    pub requests_allowed: AtomicU64,
    pub requests_denied: AtomicU64,
}

/// Snapshot of rate limiting metrics
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub requests_allowed: u64,
    pub requests_denied: u64,
    pub tracked_clients: usize,
}

/// Sliding-window rate limiter keyed by client identity
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,

    /// Client key → timestamps (ms) of allowed requests, oldest first
    windows: Arc<ClientWindows>,

    metrics: RateLimitMetrics,

    /// Stops the idle-window cleanup task
    shutdown: CancellationToken,
}

/// Drop windows whose newest request is older than the window
fn prune_idle(windows: &ClientWindows, window_ms: u64, now_ms: u64) -> usize {
    let before = windows.len();
    windows.retain(|_, timestamps| {
        timestamps
            .back()
            .map_or(false, |&newest| now_ms.saturating_sub(newest) < window_ms)
    });
    before.saturating_sub(windows.len())
}

impl SlidingWindowLimiter {
    /// Create a limiter. The cleanup task is only started when called from within a Tokio
    /// runtime.
    pub fn new(config: RateLimitConfig) -> Result<Self, RateLimitError> {
        if config.enabled {
            if config.max_requests == 0 {
                return Err(RateLimitError::Configuration(
                    "max_requests must be greater than 0".to_string(),
                ));
            }
            if config.window.is_zero() {
                return Err(RateLimitError::Configuration(
                    "window must be greater than 0".to_string(),
                ));
            }
            if config.cleanup_interval.is_zero() {
                return Err(RateLimitError::Configuration(
                    "cleanup_interval must be greater than 0".to_string(),
                ));
            }
        }

        let windows = Arc::new(ClientWindows::new());
        let shutdown = CancellationToken::new();

        if config.enabled {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(Self::cleanup_loop(
                    windows.clone(),
                    config.window,
                    config.cleanup_interval,
                    shutdown.clone(),
                ));
            }
        }

        Ok(Self {
            config,
            windows,
            metrics: RateLimitMetrics::default(),
            shutdown,
        })
    }

    async fn cleanup_loop(
        windows: Arc<ClientWindows>,
        window: Duration,
        every: Duration,
        shutdown: CancellationToken,
    ) {
        let window_ms = window.as_millis() as u64;
        let mut ticker = interval(every);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let dropped = prune_idle(&windows, window_ms, now_millis());
                    if dropped > 0 {
                        debug!("Dropped {} idle rate limit windows", dropped);
                    }
                }
            }
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Key for a client identity
    pub fn client_key(&self, client: &str) -> String {
        format!("{}:{}", self.config.key_prefix, client)
    }

    /// Check and record a request for the client now
    pub fn check(&self, client: &str, path: &str) -> RateLimitResult {
        self.check_at(client, path, now_millis())
    }

    /// Check and record a request for the client at `now_ms`
    pub fn check_at(&self, client: &str, path: &str, now_ms: u64) -> RateLimitResult {
        let limit = self.config.max_requests;
        if !self.config.enabled || self.is_exempt(path) {
            return RateLimitResult::unlimited(limit, self.config.window);
        }

        let window_ms = self.config.window.as_millis() as u64;
        let key = self.client_key(client);

        let result = {
            let mut timestamps = self.windows.entry(key.clone()).or_default();
            while timestamps
                .front()
                .map_or(false, |&oldest| now_ms.saturating_sub(oldest) >= window_ms)
            {
                timestamps.pop_front();
            }

            let allowed = timestamps.len() < limit as usize;
            if allowed {
                timestamps.push_back(now_ms);
            }

            let oldest = timestamps.front().copied().unwrap_or(now_ms);
            let reset_ms = oldest + window_ms;
            RateLimitResult {
                allowed,
                limit,
                remaining: limit.saturating_sub(timestamps.len() as u32),
                reset_time: UNIX_EPOCH + Duration::from_millis(reset_ms),
                retry_after: (!allowed).then(|| Duration::from_millis(reset_ms.saturating_sub(now_ms))),
            }
        };

        if result.allowed {
            self.metrics.requests_allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.requests_denied.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Rate limit exceeded for {} ({} requests per {:?})",
                key, limit, self.config.window
            );
        }

        result
    }

    /// Forget a client's window
    pub fn reset(&self, client: &str) -> bool {
        self.windows.remove(&self.client_key(client)).is_some()
    }

    /// Drop windows with no request inside the trailing window. Returns how many were dropped.
    pub fn cleanup_at(&self, now_ms: u64) -> usize {
        prune_idle(&self.windows, self.config.window.as_millis() as u64, now_ms)
    }

    pub fn get_metrics(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            requests_allowed: self.metrics.requests_allowed.load(Ordering::Relaxed),
            requests_denied: self.metrics.requests_denied.load(Ordering::Relaxed),
            tracked_clients: self.windows.len(),
        }
    }

    fn is_exempt(&self, path: &str) -> bool {
        self.config.exempt_paths.iter().any(|pattern| {
            if let Some(prefix) = pattern.strip_suffix('*') {
                path.starts_with(prefix)
            } else {
                path == pattern
            }
        })
    }
}

impl Drop for SlidingWindowLimiter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
