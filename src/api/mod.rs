//! API Layer Module
//!
//! HTTP server, routes, middleware and error responses.

pub mod error;
pub mod middleware;
pub mod routes;
pub mod server;

// Re-exports for convenience
pub use error::ApiError;
pub use middleware::{RateLimitConfig, RateLimiter, RateLimitState};
pub use server::{create_router, start_server, SharedState};
