//! # Core Types Module
//!
//! Request and response shapes used by the caching middleware. The HTTP transport layer is
//! external; it converts its own request type into an [`IncomingRequest`] and turns the
//! returned [`ApiResponse`] back into a wire response.

use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Represents an incoming request as seen by the caching middleware
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// Unique identifier for this request (for tracing and logging)
    pub id: String,

    /// HTTP method (GET, POST, etc.)
    pub method: Method,

    /// Request URI including path and query parameters
    pub uri: Uri,

    /// Request headers
    pub headers: HeaderMap,

    /// Request body as bytes
    pub body: Arc<Vec<u8>>,

    /// Client's remote address
    pub remote_addr: SocketAddr,

    /// Timestamp when the request was received
    pub received_at: Instant,
}

impl IncomingRequest {
    /// Create a new incoming request with a generated ID
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Vec<u8>,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method,
            uri,
            headers,
            body: Arc::new(body),
            remote_addr,
            received_at: Instant::now(),
        }
    }

    /// Get the request path without query parameters
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Get query parameters as a string
    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Get a header value by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    /// Client address used for rate limiting.
    ///
    /// `X-Forwarded-For` counts only when the socket peer is one of `trusted_proxies`. The hops
    /// are then read right to left and the first address that is not itself a trusted proxy
    /// wins. A malformed hop stops the walk at the peer.
    pub fn client_ip(&self, trusted_proxies: &[IpAddr]) -> IpAddr {
        let peer = self.remote_addr.ip();
        if !trusted_proxies.contains(&peer) {
            return peer;
        }

        let Some(forwarded) = self.header("x-forwarded-for") else {
            return peer;
        };
        for hop in forwarded.rsplit(',') {
            match hop.trim().parse::<IpAddr>() {
                Ok(ip) if trusted_proxies.contains(&ip) => continue,
                Ok(ip) => return ip,
                Err(_) => return peer,
            }
        }
        peer
    }

    /// Whether the request carries credentials (Authorization header or cookies)
    pub fn has_credentials(&self) -> bool {
        self.headers.contains_key("authorization") || self.headers.contains_key("cookie")
    }
}

/// Request context that flows through the middleware
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Reference to the original request
    pub request: Arc<IncomingRequest>,

    /// Unique trace ID for log correlation
    pub trace_id: String,

    /// Authentication context (if authenticated upstream of the cache)
    pub auth_context: Option<Arc<AuthContext>>,

    /// Request start time for latency measurement
    pub start_time: Instant,

    /// Additional context data that middleware can set
    pub data: HashMap<String, serde_json::Value>,
}

impl RequestContext {
    /// Create a new request context
    pub fn new(request: Arc<IncomingRequest>) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            request,
            auth_context: None,
            start_time: Instant::now(),
            data: HashMap::new(),
        }
    }

    /// Get elapsed time since request started
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Set authentication context
    pub fn set_auth_context(&mut self, auth: AuthContext) {
        self.auth_context = Some(Arc::new(auth));
    }
}

/// Authentication context containing user information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    /// Unique user identifier
    pub user_id: String,

    /// User roles
    pub roles: Vec<String>,

    /// Authentication method used
    pub auth_method: String,
}

/// Response produced by a downstream handler or served from cache
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// HTTP status code
    pub status: StatusCode,

    /// Response headers
    pub headers: HeaderMap,

    /// Response body
    pub body: Arc<Vec<u8>>,
}

impl ApiResponse {
    /// Create a new response
    pub fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body: Arc::new(body),
        }
    }

    /// Create a simple text response
    pub fn text(status: StatusCode, text: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        Self::new(status, headers, text.into().into_bytes())
    }

    /// Create a JSON response
    pub fn json<T: Serialize>(status: StatusCode, data: &T) -> Result<Self, serde_json::Error> {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let body = serde_json::to_vec(data)?;
        Ok(Self::new(status, headers, body))
    }

    /// Create an empty 304 response
    pub fn not_modified() -> Self {
        Self::new(StatusCode::NOT_MODIFIED, HeaderMap::new(), Vec::new())
    }

    /// Get a header value by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }
}
