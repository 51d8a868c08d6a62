//! Outbound call discipline: adaptive rate limiting and circuit breaking.

pub mod adaptive;
pub mod breaker;

pub use adaptive::{AdaptiveRateLimiter, RateLimiterRegistry, RateLimiterStats};
pub use breaker::{CircuitBreaker, CircuitOpen, CircuitState};
