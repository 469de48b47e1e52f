//! Gzip compression of cached payloads.
//!
//! A payload is only stored compressed when it is at least `threshold` bytes and the
//! compressed form is no larger than `min_ratio` of the original.

use super::CacheResult;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Compression decision parameters
#[derive(Debug, Clone, Copy)]
pub struct CompressionPolicy {
    /// Minimum payload size worth compressing
    pub threshold: usize,

    /// Maximum compressed/original ratio for the compressed form to be kept
    pub min_ratio: f64,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            threshold: 1024,
            min_ratio: 0.8,
        }
    }
}

impl CompressionPolicy {
    /// Compress the payload when it pays off
    pub fn maybe_compress(&self, data: &[u8]) -> CacheResult<Option<Vec<u8>>> {
        if data.len() < self.threshold {
            return Ok(None);
        }

        let compressed = compress(data)?;
        let ratio = compressed.len() as f64 / data.len() as f64;
        if ratio <= self.min_ratio {
            Ok(Some(compressed))
        } else {
            Ok(None)
        }
    }
}

/// Gzip-compress a payload
pub fn compress(data: &[u8]) -> CacheResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompress a gzip payload
pub fn decompress(data: &[u8]) -> CacheResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}
