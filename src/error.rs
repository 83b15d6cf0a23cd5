//! Error taxonomy for the resilience layer.
//!
//! Every failure that can reach the orchestrator boundary is one of these variants.
//! The orchestrator converts them into failed responses using [`ResilienceError::code`],
//! so the codes are part of the wire contract and must stay stable.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ResilienceError {
    /// The circuit is open, the half-open trial slot is taken, or the handler failed.
    #[error("service '{service}' unavailable: {reason}")]
    ServiceUnavailable { service: String, reason: String },

    /// The bulkhead has no free slot and its wait queue is full.
    #[error("service '{service}' at capacity ({active} active, {queued} queued)")]
    CapacityExceeded {
        service: String,
        active: usize,
        queued: usize,
    },

    /// A rate-limit window is exhausted or the caller is temporarily blocked.
    #[error("rate limited by policy '{policy}', retry in {retry_after_ms}ms")]
    RateLimited {
        policy: String,
        remaining: u32,
        retry_after_ms: u64,
    },

    /// Payload validation found a high or critical threat.
    #[error("request blocked: {reason}")]
    ValidationBlocked { reason: String },

    #[error("operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Non-fatal: logged and treated as a cache miss.
    #[error("cache error: {0}")]
    Cache(String),

    #[error("service '{0}' is not registered")]
    UnknownService(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ResilienceError {
    /// Stable machine-readable code reported in failed responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::ValidationBlocked { .. } => "VALIDATION_BLOCKED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Cache(_) => "CACHE_ERROR",
            Self::UnknownService(_) => "UNKNOWN_SERVICE",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
        }
    }

    /// Build the error used when a wrapped handler fails.
    pub fn handler_failure(service: &str, err: impl std::fmt::Display) -> Self {
        Self::ServiceUnavailable {
            service: service.to_string(),
            reason: err.to_string(),
        }
    }
}
