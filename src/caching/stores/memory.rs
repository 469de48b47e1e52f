//! # In-Memory Cache Backend
//!
//! A process-local [`CacheBackend`] built on `DashMap` with TTL support, a tag index,
//! least-recently-used eviction once `max_entries` is reached and periodic cleanup of expired
//! entries. Expiry uses `tokio::time::Instant`, so tests can drive it with a paused clock.

use super::{glob_match, CacheBackend, CacheStoreStats};
use crate::caching::CacheResult;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::debug;

const KEY_SEPARATOR: &str = "::";

/// In-memory backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryBackendConfig {
    /// Maximum number of entries across all namespaces (0 = unbounded)
    pub max_entries: usize,

    /// Cleanup interval for expired entries
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for InMemoryBackendConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: Instant,
    last_accessed: Instant,
    tags: Vec<String>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-memory backend implementation
pub struct InMemoryBackend {
    /// Configuration
    config: InMemoryBackendConfig,

    /// Entries keyed by `namespace::key`
    entries: Arc<DashMap<String, StoredValue>>,

    /// Tag index keyed by `namespace::tag`
    tag_index: Arc<DashMap<String, HashSet<String>>>,

    /// Atomic counters for statistics
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_cleanups: Arc<AtomicU64>,

    /// Current memory usage estimate
    memory_usage: Arc<AtomicUsize>,

    /// Cleanup task handle
    cleanup_task: Option<JoinHandle<()>>,
}

fn full_key(namespace: &str, key: &str) -> String {
    format!("{}{}{}", namespace, KEY_SEPARATOR, key)
}

fn namespace_prefix(namespace: &str) -> String {
    format!("{}{}", namespace, KEY_SEPARATOR)
}

impl InMemoryBackend {
    /// Create a new in-memory backend.
    ///
    /// The cleanup task is only started when called from within a Tokio runtime.
    pub fn new(config: InMemoryBackendConfig) -> Self {
        let entries: Arc<DashMap<String, StoredValue>> = Arc::new(DashMap::new());
        let tag_index: Arc<DashMap<String, HashSet<String>>> = Arc::new(DashMap::new());
        let expired_cleanups = Arc::new(AtomicU64::new(0));
        let memory_usage = Arc::new(AtomicUsize::new(0));

        let cleanup_task = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let entries = entries.clone();
            let tag_index = tag_index.clone();
            let expired_cleanups = expired_cleanups.clone();
            let memory_usage = memory_usage.clone();
            let cleanup_interval = config.cleanup_interval;

            handle.spawn(async move {
                let mut ticker = interval(cleanup_interval);
                loop {
                    ticker.tick().await;
                    Self::cleanup_expired_entries(
                        &entries,
                        &tag_index,
                        &expired_cleanups,
                        &memory_usage,
                    );
                }
            })
        });

        Self {
            config,
            entries,
            tag_index,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired_cleanups,
            memory_usage,
            cleanup_task,
        }
    }

    /// Remove expired entries and their tag index references
    fn cleanup_expired_entries(
        entries: &DashMap<String, StoredValue>,
        tag_index: &DashMap<String, HashSet<String>>,
        expired_cleanups: &AtomicU64,
        memory_usage: &AtomicUsize,
    ) {
        let now = Instant::now();
        let expired_keys: Vec<String> = entries
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut cleaned = 0u64;
        for key in expired_keys {
            if let Some((full, stored)) = entries.remove(&key) {
                memory_usage.fetch_sub(stored.value.len(), Ordering::Relaxed);
                Self::unindex_tags(tag_index, &full, &stored.tags);
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            expired_cleanups.fetch_add(cleaned, Ordering::Relaxed);
            debug!("Cleaned up {} expired cache entries", cleaned);
        }
    }

    fn unindex_tags(tag_index: &DashMap<String, HashSet<String>>, full: &str, tags: &[String]) {
        let namespace = full.split(KEY_SEPARATOR).next().unwrap_or_default();
        for tag in tags {
            let tag_key = full_key(namespace, tag);
            let now_empty = match tag_index.get_mut(&tag_key) {
                Some(mut members) => {
                    members.remove(full);
                    members.is_empty()
                }
                None => false,
            };
            if now_empty {
                tag_index.remove_if(&tag_key, |_, members| members.is_empty());
            }
        }
    }

    fn remove_full_key(&self, full: &str) -> bool {
        match self.entries.remove(full) {
            Some((full, stored)) => {
                self.memory_usage
                    .fetch_sub(stored.value.len(), Ordering::Relaxed);
                Self::unindex_tags(&self.tag_index, &full, &stored.tags);
                true
            }
            None => false,
        }
    }

    /// Evict the least recently used entry when the backend is full.
    ///
    /// Finding the victim scans every entry, so inserts into a full backend are O(n). That is
    /// fine at the default `max_entries`; larger deployments should use the Redis backend.
    fn evict_if_needed(&self, incoming: &str) {
        if self.config.max_entries == 0
            || self.entries.len() < self.config.max_entries
            || self.entries.contains_key(incoming)
        {
            return;
        }

        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().last_accessed)
            .map(|entry| entry.key().clone());

        if let Some(victim) = victim {
            if self.remove_full_key(&victim) {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("Evicted least recently used cache entry: {}", victim);
            }
        }
    }

    fn namespace_keys(&self, namespace: &str, pattern: &str) -> Vec<String> {
        let prefix = namespace_prefix(namespace);
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .filter_map(|entry| {
                entry
                    .key()
                    .strip_prefix(&prefix)
                    .filter(|key| glob_match(pattern, key))
                    .map(str::to_string)
            })
            .collect()
    }
}

impl Drop for InMemoryBackend {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn get(&self, namespace: &str, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let full = full_key(namespace, key);
        let now = Instant::now();

        let found = match self.entries.get_mut(&full) {
            Some(mut stored) if !stored.is_expired(now) => {
                stored.last_accessed = now;
                Some(stored.value.clone())
            }
            Some(_) => None,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };

        match found {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(value))
            }
            None => {
                // expired but not yet collected
                if self.remove_full_key(&full) {
                    self.expired_cleanups.fetch_add(1, Ordering::Relaxed);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &[u8],
        ttl: Duration,
        tags: &[String],
    ) -> CacheResult<bool> {
        let full = full_key(namespace, key);
        self.evict_if_needed(&full);

        // drop the previous value so stale tags do not linger in the index
        self.remove_full_key(&full);

        let now = Instant::now();
        let stored = StoredValue {
            value: value.to_vec(),
            expires_at: now + ttl,
            last_accessed: now,
            tags: tags.to_vec(),
        };

        for tag in tags {
            self.tag_index
                .entry(full_key(namespace, tag))
                .or_default()
                .insert(full.clone());
        }

        self.memory_usage.fetch_add(value.len(), Ordering::Relaxed);
        self.entries.insert(full, stored);
        Ok(true)
    }

    async fn delete(&self, namespace: &str, key: &str) -> CacheResult<bool> {
        Ok(self.remove_full_key(&full_key(namespace, key)))
    }

    async fn delete_pattern(&self, namespace: &str, pattern: &str) -> CacheResult<u64> {
        let mut deleted = 0u64;
        for key in self.namespace_keys(namespace, pattern) {
            if self.remove_full_key(&full_key(namespace, &key)) {
                deleted += 1;
            }
        }
        debug!(
            "Deleted {} keys matching '{}' in namespace '{}'",
            deleted, pattern, namespace
        );
        Ok(deleted)
    }

    async fn delete_by_tag(&self, namespace: &str, tag: &str) -> CacheResult<u64> {
        let members = self
            .tag_index
            .remove(&full_key(namespace, tag))
            .map(|(_, members)| members)
            .unwrap_or_default();

        let mut deleted = 0u64;
        for full in members {
            if self.remove_full_key(&full) {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn ttl(&self, namespace: &str, key: &str) -> CacheResult<Option<Duration>> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(&full_key(namespace, key))
            .filter(|stored| !stored.is_expired(now))
            .map(|stored| stored.expires_at.saturating_duration_since(now)))
    }

    async fn keys(&self, namespace: &str, pattern: &str) -> CacheResult<Vec<String>> {
        Ok(self.namespace_keys(namespace, pattern))
    }

    async fn stats(&self) -> CacheResult<CacheStoreStats> {
        Ok(CacheStoreStats {
            entries: self.entries.len(),
            memory_usage: self.memory_usage.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_cleanups: self.expired_cleanups.load(Ordering::Relaxed),
        })
    }

    async fn health_check(&self) -> CacheResult<bool> {
        let namespace = "__health__";
        let test_key = "probe";
        let test_value = b"health_check_value";

        self.set(namespace, test_key, test_value, Duration::from_secs(1), &[])
            .await?;
        let retrieved = self.get(namespace, test_key).await?;
        self.delete(namespace, test_key).await?;

        Ok(retrieved.as_deref() == Some(test_value.as_slice()))
    }
}
