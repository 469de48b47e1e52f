//! # Cache Stores Module
//!
//! The [`CacheBackend`] trait is the only contract the engine needs from a key-value store:
//! namespaced get/set/delete, glob pattern deletion, tag deletion and TTL inspection.
//! Eviction, persistence and replication are the backend's business.

pub mod memory;
pub mod redis_store;

pub use memory::{InMemoryBackend, InMemoryBackendConfig};
pub use redis_store::{RedisBackend, RedisBackendConfig};

use super::CacheResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Trait for cache backend implementations
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get a value from the namespace
    async fn get(&self, namespace: &str, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Set a value with TTL and optional tags. Returns whether the value was stored.
    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &[u8],
        ttl: Duration,
        tags: &[String],
    ) -> CacheResult<bool>;

    /// Delete a value. Deleting a missing key returns `Ok(false)`.
    async fn delete(&self, namespace: &str, key: &str) -> CacheResult<bool>;

    /// Delete every key in the namespace matching a glob pattern (`*`, `?`)
    async fn delete_pattern(&self, namespace: &str, pattern: &str) -> CacheResult<u64>;

    /// Delete every key in the namespace carrying the tag
    async fn delete_by_tag(&self, namespace: &str, tag: &str) -> CacheResult<u64>;

    /// Remaining time to live, `None` when the key does not exist
    async fn ttl(&self, namespace: &str, key: &str) -> CacheResult<Option<Duration>>;

    /// List keys in the namespace matching a glob pattern
    async fn keys(&self, namespace: &str, pattern: &str) -> CacheResult<Vec<String>>;

    /// Get backend statistics
    async fn stats(&self) -> CacheResult<CacheStoreStats>;

    /// Perform health check
    async fn health_check(&self) -> CacheResult<bool>;
}

/// Cache store statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStoreStats {
    /// Number of entries
    pub entries: usize,

    /// Total memory usage in bytes
    pub memory_usage: usize,

    /// Number of hits
    pub hits: u64,

    /// Number of misses
    pub misses: u64,

    /// Number of evictions
    pub evictions: u64,

    /// Number of expired entries cleaned up
    pub expired_cleanups: u64,
}

/// Redis-style glob matching supporting `*` and `?`
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut star_text = 0usize;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_text = t;
            p += 1;
        } else if let Some(star_pos) = star {
            p = star_pos + 1;
            star_text += 1;
            t = star_text;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }

    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::glob_match;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("GET /api/users*", "GET /api/users?page=2"));
        assert!(glob_match("*users*", "GET /api/users/42"));
        assert!(glob_match("user:?", "user:7"));
        assert!(!glob_match("user:?", "user:42"));
        assert!(!glob_match("/api/orders*", "/api/users"));
        assert!(glob_match("", ""));
        assert!(!glob_match("", "x"));
    }
}
