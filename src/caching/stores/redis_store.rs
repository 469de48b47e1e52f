//! # Redis Cache Backend
//!
//! A [`CacheBackend`] over a shared Redis instance. Keys are laid out as
//! `{prefix}{namespace}:{key}`; tag membership is tracked in Redis sets under
//! `{prefix}{namespace}:__tag__:{tag}` which expire alongside the entries they index.
//! Tag set expiry only ever grows (`EXPIRE ... GT`), which requires Redis 7.

use super::{CacheBackend, CacheStoreStats};
use crate::caching::CacheResult;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};

const TAG_MARKER: &str = "__tag__:";
const SCAN_COUNT: usize = 1000;

/// Redis backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisBackendConfig {
    /// Redis connection URL
    pub url: String,

    /// Key prefix for all cache entries
    pub key_prefix: String,
}

impl Default for RedisBackendConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "cache-engine:".to_string(),
        }
    }
}

/// Redis backend implementation
pub struct RedisBackend {
    /// Configuration
    config: RedisBackendConfig,

    /// Redis connection manager; reconnects on its own and is cheap to clone
    connection: ConnectionManager,

    /// Statistics counters
    hits: AtomicU64,
    misses: AtomicU64,
    connection_errors: AtomicU64,
}

fn entry_key(prefix: &str, namespace: &str, key: &str) -> String {
    format!("{}{}:{}", prefix, namespace, key)
}

fn tag_key(prefix: &str, namespace: &str, tag: &str) -> String {
    format!("{}{}:{}{}", prefix, namespace, TAG_MARKER, tag)
}

/// Convert a Redis `TTL` reply into a remaining duration
fn ttl_from_reply(reply: i64) -> Option<Duration> {
    match reply {
        -2 => None,
        -1 => Some(Duration::MAX),
        secs if secs >= 0 => Some(Duration::from_secs(secs as u64)),
        _ => None,
    }
}

impl RedisBackend {
    /// Connect to Redis
    pub async fn new(config: RedisBackendConfig) -> CacheResult<Self> {
        let client = Client::open(config.url.as_str())?;
        let connection = ConnectionManager::new(client).await?;

        info!("Redis cache backend connected to {}", config.url);

        Ok(Self {
            config,
            connection,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
        })
    }

    fn full_key(&self, namespace: &str, key: &str) -> String {
        entry_key(&self.config.key_prefix, namespace, key)
    }

    fn record_error(&self, operation: &str, err: &redis::RedisError) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
        error!("Redis {} failed: {}", operation, err);
    }

    /// Collect every key matching a raw Redis pattern using SCAN
    async fn scan(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut all_keys = Vec::new();

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|e| {
                    self.record_error("SCAN", &e);
                    e
                })?;

            all_keys.extend(keys);

            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }

        Ok(all_keys)
    }

    async fn delete_full_keys(&self, keys: &[String]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection.clone();
        let deleted: u64 = conn.del(keys).await.map_err(|e| {
            self.record_error("DEL", &e);
            e
        })?;
        Ok(deleted)
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, namespace: &str, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.connection.clone();
        let full_key = self.full_key(namespace, key);

        let value: Option<Vec<u8>> = conn.get(&full_key).await.map_err(|e| {
            self.record_error("GET", &e);
            e
        })?;

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Redis cache hit for key: {}", full_key);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Redis cache miss for key: {}", full_key);
        }

        Ok(value)
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &[u8],
        ttl: Duration,
        tags: &[String],
    ) -> CacheResult<bool> {
        let mut conn = self.connection.clone();
        let full_key = self.full_key(namespace, key);
        // SET EX rejects a zero expiry
        let ttl_seconds = ttl.as_secs().max(1);

        let mut pipe = redis::pipe();
        pipe.cmd("SET")
            .arg(&full_key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds)
            .ignore();

        for tag in tags {
            let tag_set = tag_key(&self.config.key_prefix, namespace, tag);
            pipe.cmd("SADD").arg(&tag_set).arg(&full_key).ignore();
            pipe.cmd("EXPIRE")
                .arg(&tag_set)
                .arg(ttl_seconds)
                .arg("GT")
                .ignore();
            pipe.cmd("EXPIRE")
                .arg(&tag_set)
                .arg(ttl_seconds)
                .arg("NX")
                .ignore();
        }

        pipe.query_async::<_, ()>(&mut conn).await.map_err(|e| {
            self.record_error("SET", &e);
            e
        })?;

        debug!("Set Redis cache key: {} with TTL: {:?}", full_key, ttl);
        Ok(true)
    }

    async fn delete(&self, namespace: &str, key: &str) -> CacheResult<bool> {
        let deleted = self
            .delete_full_keys(&[self.full_key(namespace, key)])
            .await?;
        Ok(deleted > 0)
    }

    async fn delete_pattern(&self, namespace: &str, pattern: &str) -> CacheResult<u64> {
        let tag_prefix = tag_key(&self.config.key_prefix, namespace, "");
        let keys: Vec<String> = self
            .scan(&self.full_key(namespace, pattern))
            .await?
            .into_iter()
            .filter(|k| !k.starts_with(&tag_prefix))
            .collect();

        let deleted = self.delete_full_keys(&keys).await?;
        debug!(
            "Deleted {} Redis keys matching '{}' in namespace '{}'",
            deleted, pattern, namespace
        );
        Ok(deleted)
    }

    async fn delete_by_tag(&self, namespace: &str, tag: &str) -> CacheResult<u64> {
        let mut conn = self.connection.clone();
        let tag_set = tag_key(&self.config.key_prefix, namespace, tag);

        let members: Vec<String> = conn.smembers(&tag_set).await.map_err(|e| {
            self.record_error("SMEMBERS", &e);
            e
        })?;

        let deleted = self.delete_full_keys(&members).await?;
        self.delete_full_keys(&[tag_set]).await?;
        Ok(deleted)
    }

    async fn ttl(&self, namespace: &str, key: &str) -> CacheResult<Option<Duration>> {
        let mut conn = self.connection.clone();
        let reply: i64 = redis::cmd("TTL")
            .arg(self.full_key(namespace, key))
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                self.record_error("TTL", &e);
                e
            })?;
        Ok(ttl_from_reply(reply))
    }

    async fn keys(&self, namespace: &str, pattern: &str) -> CacheResult<Vec<String>> {
        let prefix = self.full_key(namespace, "");
        Ok(self
            .scan(&self.full_key(namespace, pattern))
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .filter(|k| !k.starts_with(TAG_MARKER))
            .collect())
    }

    async fn stats(&self) -> CacheResult<CacheStoreStats> {
        let mut conn = self.connection.clone();
        let info: String = redis::cmd("INFO")
            .arg("memory")
            .query_async(&mut conn)
            .await
            .unwrap_or_default();

        let memory_usage = info
            .lines()
            .find(|line| line.starts_with("used_memory:"))
            .and_then(|line| line.split(':').nth(1))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);

        let entries = self
            .scan(&format!("{}*", self.config.key_prefix))
            .await
            .map(|keys| keys.iter().filter(|k| !k.contains(TAG_MARKER)).count())
            .unwrap_or(0);

        Ok(CacheStoreStats {
            entries,
            memory_usage,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            // Redis handles eviction and expiry internally
            evictions: 0,
            expired_cleanups: 0,
        })
    }

    async fn health_check(&self) -> CacheResult<bool> {
        let mut conn = self.connection.clone();
        let result = redis::cmd("PING").query_async::<_, String>(&mut conn).await;

        match result {
            Ok(response) => Ok(response == "PONG"),
            Err(e) => {
                self.record_error("PING", &e);
                Ok(false)
            }
        }
    }
}
