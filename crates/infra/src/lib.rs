//! Infrastructure for the email delivery queue: storage, connection pooling,
//! throttling, and the delivery worker.

pub mod circuit_breaker;
pub mod config;
pub mod pool;
pub mod queue;
pub mod rate_limit;
pub mod tenants;
pub mod transport;
pub mod workers;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
pub use config::{ConfigError, CourierConfig};
pub use rate_limit::{RateLimiterConfig, RateLimiterRegistry};
pub use transport::{SendFailure, Transport};

#[cfg(test)]
mod integration_tests;
