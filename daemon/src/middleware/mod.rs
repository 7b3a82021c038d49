//! Request-boundary middleware for the command API.

pub mod auth;
pub mod rate_limit;

pub use auth::AuthMiddleware;
pub use rate_limit::{RateLimitConfig, RateLimitMiddleware};
