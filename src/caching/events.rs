//! # Cache Events
//!
//! Structured events emitted by the caches, the invalidator and the validator for auditing
//! and alerting. Every event carries an operation id; events describing work carry the
//! affected-key count and the duration in milliseconds.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Default event channel capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Cache engine event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheEvent {
    CacheHit {
        operation_id: String,
        cache: String,
        key: String,
        duration_ms: u64,
    },

    CacheMiss {
        operation_id: String,
        cache: String,
        key: String,
        duration_ms: u64,
    },

    ResponseCached {
        operation_id: String,
        key: String,
        ttl: u64,
        size: usize,
        compressed: bool,
        duration_ms: u64,
    },

    ResponsesInvalidated {
        operation_id: String,
        patterns: Vec<String>,
        affected_keys: usize,
        duration_ms: u64,
    },

    TableInvalidated {
        operation_id: String,
        tables: Vec<String>,
        keys: Vec<String>,
        affected_keys: usize,
        cascade_depth: usize,
        duration_ms: u64,
    },

    DataInvalidated {
        operation_id: String,
        identifiers: Vec<String>,
        keys: Vec<String>,
        affected_keys: usize,
        fuzzy: bool,
        duration_ms: u64,
    },

    SmartInvalidationCompleted {
        operation_id: String,
        change_type: String,
        risk_level: String,
        strategy: String,
        keys: Vec<String>,
        affected_keys: usize,
        duration_ms: u64,
    },

    CacheHealthAlert {
        operation_id: String,
        tier: String,
        status: String,
        valid_ratio: f64,
        sampled: usize,
    },

    ValidationReport {
        operation_id: String,
        namespace: String,
        key: String,
        valid: bool,
        failed_rules: Vec<String>,
        duration_ms: u64,
    },

    Error {
        operation_id: String,
        operation: String,
        message: String,
    },
}

impl CacheEvent {
    /// Event name as emitted on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Self::CacheHit { .. } => "cache_hit",
            Self::CacheMiss { .. } => "cache_miss",
            Self::ResponseCached { .. } => "response_cached",
            Self::ResponsesInvalidated { .. } => "responses_invalidated",
            Self::TableInvalidated { .. } => "table_invalidated",
            Self::DataInvalidated { .. } => "data_invalidated",
            Self::SmartInvalidationCompleted { .. } => "smart_invalidation_completed",
            Self::CacheHealthAlert { .. } => "cache_health_alert",
            Self::ValidationReport { .. } => "validation_report",
            Self::Error { .. } => "error",
        }
    }

    /// Operation id shared by every event
    pub fn operation_id(&self) -> &str {
        match self {
            Self::CacheHit { operation_id, .. }
            | Self::CacheMiss { operation_id, .. }
            | Self::ResponseCached { operation_id, .. }
            | Self::ResponsesInvalidated { operation_id, .. }
            | Self::TableInvalidated { operation_id, .. }
            | Self::DataInvalidated { operation_id, .. }
            | Self::SmartInvalidationCompleted { operation_id, .. }
            | Self::CacheHealthAlert { operation_id, .. }
            | Self::ValidationReport { operation_id, .. }
            | Self::Error { operation_id, .. } => operation_id,
        }
    }

    /// Number of affected keys for invalidation events
    pub fn affected_keys(&self) -> Option<usize> {
        match self {
            Self::ResponsesInvalidated { affected_keys, .. }
            | Self::TableInvalidated { affected_keys, .. }
            | Self::DataInvalidated { affected_keys, .. }
            | Self::SmartInvalidationCompleted { affected_keys, .. } => Some(*affected_keys),
            _ => None,
        }
    }

    /// Build an error event
    pub fn error(operation: &str, message: impl Into<String>) -> Self {
        Self::Error {
            operation_id: new_operation_id(),
            operation: operation.to_string(),
            message: message.into(),
        }
    }
}

/// Generate a fresh operation id
pub fn new_operation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Broadcast channel for cache events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CacheEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Create an event bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }

    /// Emit an event; having no subscribers is not an error
    pub fn emit(&self, event: CacheEvent) {
        if self.sender.send(event).is_err() {
            trace!("Cache event dropped, no subscribers");
        }
    }
}
