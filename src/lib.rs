//! # Cache Engine
//!
//! Response and query caching with dependency-tracked invalidation, for API handlers and
//! database callers.
//!
//! ## Modules
//! - [`caching`]: backends, cache entries, key derivation, the response and query caches, the
//!   invalidator and the integrity validator
//! - [`middleware`]: rate limiting plus the API and database interception layers
//! - [`engine`]: [`CacheEngine`], which wires every component over one backend
//! - [`core`]: configuration, errors and request/response types
//! - [`observability`]: logging initialization and metrics
//!
//! ## Example
//! ```no_run
//! use cache_engine::{CacheEngine, EngineConfig};
//!
//! # async fn run() -> cache_engine::EngineResult<()> {
//! let engine = CacheEngine::connect(EngineConfig::default()).await?;
//! // ... serve requests through engine.api_middleware() ...
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

/// Configuration, errors and request/response types
pub mod core;

/// Caching and invalidation engine
pub mod caching;

/// Request and query interception layers
pub mod middleware;

/// Logging and metrics
pub mod observability;

/// Engine facade
pub mod engine;

pub use core::config::EngineConfig;
pub use core::error::{EngineError, EngineResult};
pub use core::types::{ApiResponse, AuthContext, IncomingRequest, RequestContext};
pub use engine::{CacheEngine, TableInvalidation};
