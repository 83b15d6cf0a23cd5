//! Fail-fast and load-isolation primitives wrapped around every dependency call.
//!
//! - [`circuit_breaker`]: stops calling a dependency that keeps failing
//! - [`bulkhead`]: caps in-flight calls per dependency

pub mod bulkhead;
pub mod circuit_breaker;

pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadSnapshot};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
