//! # Cache Entry
//!
//! The unit stored in a [`CacheBackend`](super::CacheBackend). Entries are serialized as JSON
//! with the payload hex-encoded. An entry is fresh while `now - cached_at < ttl * 1000`;
//! the TTL is fixed at write time and never extended by reads.

use super::compression::{self, CompressionPolicy};
use super::{now_millis, CacheResult};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// HTTP date format used for `Last-Modified`
pub const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// A cached payload with its freshness and revalidation metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Payload, compressed when `compressed` is set
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,

    /// Response status code, absent for query results
    pub status: Option<u16>,

    /// Caching-safe response headers
    pub headers: BTreeMap<String, String>,

    /// Insertion time in milliseconds since the Unix epoch
    pub cached_at: u64,

    /// Time to live in seconds
    pub ttl: u64,

    /// Quoted SHA-256 fingerprint of the uncompressed payload
    pub etag: String,

    /// HTTP date of insertion
    pub last_modified: String,

    /// Whether `data` is gzip-compressed
    pub compressed: bool,

    /// Uncompressed payload size
    pub original_size: usize,

    /// Stored payload size
    pub compressed_size: usize,

    /// Tags used for tag-based invalidation
    pub tags: BTreeSet<String>,
}

impl CacheEntry {
    /// Create an uncompressed entry stamped with the current time
    pub fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self::new_at(data, ttl, now_millis())
    }

    /// Create an uncompressed entry stamped with the given time
    pub fn new_at(data: Vec<u8>, ttl: Duration, cached_at: u64) -> Self {
        let size = data.len();
        Self {
            etag: compute_etag(&data),
            last_modified: http_date(cached_at),
            data,
            status: None,
            headers: BTreeMap::new(),
            cached_at,
            ttl: ttl.as_secs(),
            compressed: false,
            original_size: size,
            compressed_size: size,
            tags: BTreeSet::new(),
        }
    }

    /// Set the response status
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the stored headers
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Add invalidation tags
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Compress the payload if the policy deems it worthwhile
    pub fn compress_with(mut self, policy: &CompressionPolicy) -> CacheResult<Self> {
        if self.compressed {
            return Ok(self);
        }
        if let Some(compressed) = policy.maybe_compress(&self.data)? {
            self.compressed_size = compressed.len();
            self.data = compressed;
            self.compressed = true;
        }
        Ok(self)
    }

    /// Whether the entry is fresh at the given time
    pub fn is_fresh_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.cached_at) < self.ttl.saturating_mul(1000)
    }

    /// Whether the entry is fresh now
    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(now_millis())
    }

    /// Age of the entry
    pub fn age(&self) -> Duration {
        Duration::from_millis(now_millis().saturating_sub(self.cached_at))
    }

    /// Time left before the entry goes stale
    pub fn remaining_ttl(&self) -> Duration {
        Duration::from_secs(self.ttl).saturating_sub(self.age())
    }

    /// The uncompressed payload
    pub fn decoded_data(&self) -> CacheResult<Vec<u8>> {
        if self.compressed {
            compression::decompress(&self.data)
        } else {
            Ok(self.data.clone())
        }
    }

    /// Whether the payload still matches its ETag
    pub fn verify_checksum(&self) -> CacheResult<bool> {
        Ok(compute_etag(&self.decoded_data()?) == self.etag)
    }

    /// `Last-Modified` as a timestamp
    pub fn last_modified_time(&self) -> Option<DateTime<Utc>> {
        parse_http_date(&self.last_modified)
    }

    /// Serialize for storage
    pub fn to_bytes(&self) -> CacheResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from storage
    pub fn from_bytes(bytes: &[u8]) -> CacheResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Quoted SHA-256 fingerprint of a payload
pub fn compute_etag(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    format!("\"{}\"", hex::encode(digest))
}

/// Format milliseconds since the epoch as an HTTP date
pub fn http_date(millis: u64) -> String {
    Utc.timestamp_millis_opt(millis as i64)
        .single()
        .unwrap_or_else(Utc::now)
        .format(HTTP_DATE_FORMAT)
        .to_string()
}

/// Parse an HTTP date
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freshness_boundary() {
        let entry = CacheEntry::new_at(b"payload".to_vec(), Duration::from_secs(60), 1_000_000);

        assert!(entry.is_fresh_at(1_000_000 + 59_000));
        assert!(!entry.is_fresh_at(1_000_000 + 60_000));
        assert!(!entry.is_fresh_at(1_000_000 + 61_000));
    }

    #[test]
    fn test_etag_and_checksum() {
        let entry = CacheEntry::new(b"payload".to_vec(), Duration::from_secs(60));
        assert!(entry.etag.starts_with('"') && entry.etag.ends_with('"'));
        assert!(entry.verify_checksum().unwrap());

        let mut tampered = entry.clone();
        tampered.data = b"other".to_vec();
        assert!(!tampered.verify_checksum().unwrap());
    }

    #[test]
    fn test_compressed_entry_round_trips() {
        let data = "abcdefgh".repeat(512).into_bytes();
        let entry = CacheEntry::new(data.clone(), Duration::from_secs(60))
            .compress_with(&CompressionPolicy::default())
            .unwrap();

        assert!(entry.compressed);
        assert_eq!(entry.original_size, data.len());
        assert!(entry.compressed_size < entry.original_size);

        let restored = CacheEntry::from_bytes(&entry.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.decoded_data().unwrap(), data);
        assert!(restored.verify_checksum().unwrap());
    }

    #[test]
    fn test_last_modified_parses() {
        let entry = CacheEntry::new_at(Vec::new(), Duration::from_secs(1), 1_700_000_000_000);
        assert_eq!(entry.last_modified, "Tue, 14 Nov 2023 22:13:20 GMT");
        assert_eq!(
            entry.last_modified_time().unwrap().timestamp(),
            1_700_000_000
        );
    }
}
