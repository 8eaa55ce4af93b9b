//! Keyed guards shared by the engine
//!
//! - Rolling-window submission limiter, one counter per participant
//! - Circuit breaker guarding outbound price-impact reports

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
