//! Resilient tool backend for writing assistance.
//!
//! Quire is an [MCP](https://modelcontextprotocol.io/) server whose tools reach
//! external dependencies (a story graph, a key-value store, a language model, local
//! analysis) only through a [`ServiceOrchestrator`](orchestrator::ServiceOrchestrator).
//! Per registered service, the orchestrator runs every call through:
//!
//! | Stage | Component | Rejects with |
//! |-------|-----------|--------------|
//! | Payload screening | [`security::Validator`] | `VALIDATION_BLOCKED` |
//! | Rate limiting | [`security::SecurityRateLimiter`] | `RATE_LIMITED` |
//! | Response cache | [`cache::IntelligentCache`] | none, a hit skips the remaining stages |
//! | Concurrency cap | [`resilience::Bulkhead`] | `CAPACITY_EXCEEDED` |
//! | Fail fast | [`resilience::CircuitBreaker`] | `SERVICE_UNAVAILABLE` |
//! | Deadline | per-service timeout | `TIMEOUT` |
//!
//! Handler latencies and error rates feed the [`profiler::PerformanceProfiler`].
//!
//! # Modules
//!
//! - [`cache`]: two-tier cache with zstd-compressed overflow and tag invalidation
//! - [`config`]: configuration loading from TOML files and environment variables
//! - [`error`]: the error taxonomy and its stable codes
//! - [`events`]: broadcast channel of circuit, cache and rate-limit events
//! - [`orchestrator`]: the request pipeline, metrics and health checks
//! - [`profiler`]: per-operation latency percentiles and error rates
//! - [`resilience`]: circuit breaker and bulkhead
//! - [`security`]: payload validation and rate limiting with temporary IP blocks

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod profiler;
pub mod resilience;
pub mod security;
pub mod server;
pub mod tools;

mod sync;
