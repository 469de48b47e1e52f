//! Request and query interception layers built on the caching engine

pub mod api_cache;
pub mod database_cache;
pub mod rate_limiting;

pub use api_cache::{ApiCacheConfig, ApiCacheMiddleware, ApiCacheStats, BypassReason, Downstream};
pub use database_cache::{CachedConnection, DatabaseCacheConfig, QueryPerformance};
pub use rate_limiting::{RateLimitConfig, RateLimitResult, SlidingWindowLimiter};
