//! # Cache Key Generator
//!
//! Deterministic, content-addressed keys for responses and query results.
//!
//! Response keys hash the upper-cased method, the path, the query string with its parameters
//! sorted, and the values of the configured vary headers. The readable request key
//! (`GET /api/users?page=2`) is kept alongside so pattern invalidation can match on it.
//!
//! Query keys hash the normalized SQL text, the bound parameters and a fingerprint of the
//! options that influence the result.

use crate::core::error::{EngineError, EngineResult};
use crate::core::types::IncomingRequest;
use serde_json::Value;
use sha2::{Digest, Sha256};

const RESPONSE_KEY_PREFIX: &str = "resp:";
const QUERY_KEY_PREFIX: &str = "query:";

/// Cache key generator
#[derive(Debug, Clone, Default)]
pub struct KeyGenerator {
    /// Lower-cased request headers that select between representations
    vary_headers: Vec<String>,
}

impl KeyGenerator {
    /// Create a key generator for the given vary headers
    pub fn new(vary_headers: &[String]) -> Self {
        let mut vary_headers: Vec<String> =
            vary_headers.iter().map(|h| h.to_ascii_lowercase()).collect();
        vary_headers.sort();
        vary_headers.dedup();
        Self { vary_headers }
    }

    /// Readable request identity: method, path and sorted query string
    pub fn request_key(&self, request: &IncomingRequest) -> EngineResult<String> {
        let path = request.path();
        if !path.starts_with('/') {
            return Err(EngineError::key_derivation(format!(
                "request path '{}' is not absolute",
                path
            )));
        }

        let method = request.method.as_str().to_ascii_uppercase();
        match request.query().map(normalize_query).filter(|q| !q.is_empty()) {
            Some(query) => Ok(format!("{} {}?{}", method, path, query)),
            None => Ok(format!("{} {}", method, path)),
        }
    }

    /// Content-addressed response cache key
    pub fn response_key(&self, request: &IncomingRequest) -> EngineResult<String> {
        let request_key = self.request_key(request)?;

        let mut hasher = Sha256::new();
        hasher.update(request_key.as_bytes());

        for name in &self.vary_headers {
            let value = match request.headers.get(name.as_str()) {
                Some(value) => value.to_str().map_err(|_| {
                    EngineError::key_derivation(format!("vary header '{}' is not valid text", name))
                })?,
                None => "",
            };
            hasher.update([0u8]);
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.trim().as_bytes());
        }

        Ok(format!("{}{}", RESPONSE_KEY_PREFIX, hex::encode(hasher.finalize())))
    }

    /// Content-addressed query cache key
    pub fn query_key(&self, sql: &str, params: &[Value], options: &Value) -> EngineResult<String> {
        let normalized = normalize_sql(sql);
        if normalized.is_empty() {
            return Err(EngineError::key_derivation("query text is empty"));
        }

        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update([0u8]);
        hasher.update(serde_json::to_vec(params)?);
        hasher.update([0u8]);
        hasher.update(serde_json::to_vec(options)?);

        Ok(format!("{}{}", QUERY_KEY_PREFIX, hex::encode(hasher.finalize())))
    }
}

/// Sort query parameters so parameter order never changes the key
pub fn normalize_query(query: &str) -> String {
    let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    pairs.sort();

    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// Normalize SQL text: collapse whitespace, lower-case everything outside string literals and
/// drop trailing semicolons
pub fn normalize_sql(sql: &str) -> String {
    let mut normalized = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;

    for ch in sql.trim().trim_end_matches(';').trim_end().chars() {
        match quote {
            Some(q) => {
                normalized.push(ch);
                if ch == q {
                    quote = None;
                }
            }
            None if ch.is_whitespace() => pending_space = true,
            None => {
                if pending_space && !normalized.is_empty() {
                    normalized.push(' ');
                }
                pending_space = false;
                if ch == '\'' || ch == '"' {
                    quote = Some(ch);
                }
                normalized.extend(ch.to_lowercase());
            }
        }
    }

    normalized
}
