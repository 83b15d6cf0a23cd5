use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::cache::CacheConfig;
use crate::error::ResilienceError;
use crate::resilience::{BulkheadConfig, CircuitBreakerConfig};
use crate::security::{RateLimitPolicy, SecurityContext, ThreatEvent, ValidationConfig};

/// Resilience settings for one logical service.
///
/// Every component is optional: a service without a `cache` section is never cached,
/// one without `circuit_breaker` never fails fast, and so on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    /// Per-call deadline for the handler. Requests may override it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bulkhead: Option<BulkheadConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,
    /// Checked in order; the first violated policy rejects the request.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rate_limits: Vec<RateLimitPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationConfig>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout_ms: None,
            circuit_breaker: None,
            bulkhead: None,
            cache: None,
            rate_limits: Vec::new(),
            validation: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn with_bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.bulkhead = Some(config);
        self
    }

    pub fn with_cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    pub fn with_rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limits.push(policy);
        self
    }

    pub fn with_validation(mut self, config: ValidationConfig) -> Self {
        self.validation = Some(config);
        self
    }

    /// Reject limits that would make the service unusable.
    pub fn check(&self) -> Result<(), ResilienceError> {
        let invalid = |msg: String| Err(ResilienceError::InvalidConfig(msg));
        if self.name.trim().is_empty() {
            return invalid("service name must not be empty".into());
        }
        if self.timeout_ms == Some(0) {
            return invalid(format!("{}: timeout_ms must be positive", self.name));
        }
        if let Some(cb) = &self.circuit_breaker {
            if cb.failure_threshold == 0 {
                return invalid(format!("{}: failure_threshold must be positive", self.name));
            }
        }
        if let Some(bh) = &self.bulkhead {
            if bh.max_concurrency == 0 {
                return invalid(format!("{}: max_concurrency must be positive", self.name));
            }
        }
        if let Some(cache) = &self.cache {
            if cache.max_entries == 0 || cache.max_bytes == 0 {
                return invalid(format!("{}: cache limits must be positive", self.name));
            }
        }
        for policy in &self.rate_limits {
            if policy.window_ms == 0 || policy.max_requests == 0 {
                return invalid(format!(
                    "{}: rate limit '{}' needs a positive window and request count",
                    self.name, policy.name
                ));
            }
        }
        Ok(())
    }
}

/// W3C-style identifiers carried from the caller to the handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
}

impl TraceContext {
    pub fn root() -> Self {
        Self {
            trace_id: Uuid::now_v7().simple().to_string(),
            span_id: new_span_id(),
            parent_span_id: None,
        }
    }

    /// A new span in `parent`'s trace, or a fresh trace when there is no parent.
    pub fn child_of(parent: Option<&TraceContext>) -> Self {
        match parent {
            Some(parent) => Self {
                trace_id: parent.trace_id.clone(),
                span_id: new_span_id(),
                parent_span_id: Some(parent.span_id.clone()),
            },
            None => Self::root(),
        }
    }
}

fn new_span_id() -> String {
    // The tail of a v7 UUID is random; the head is a timestamp.
    let id = Uuid::now_v7().simple().to_string();
    id[16..].to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    pub skip_cache: bool,
    pub skip_validation: bool,
    /// Overrides the service's `timeout_ms` for this call.
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRequest<T> {
    pub operation: String,
    pub payload: T,
    #[serde(default)]
    pub caller: SecurityContext,
    #[serde(default)]
    pub trace: Option<TraceContext>,
    #[serde(default)]
    pub options: RequestOptions,
}

impl<T> ServiceRequest<T> {
    pub fn new(operation: impl Into<String>, payload: T) -> Self {
        Self {
            operation: operation.into(),
            payload,
            caller: SecurityContext::default(),
            trace: None,
            options: RequestOptions::default(),
        }
    }

    pub fn from_caller(mut self, caller: SecurityContext) -> Self {
        self.caller = caller;
        self
    }

    pub fn with_trace(mut self, parent: TraceContext) -> Self {
        self.trace = Some(parent);
        self
    }

    pub fn skip_cache(mut self) -> Self {
        self.options.skip_cache = true;
        self
    }

    pub fn skip_validation(mut self) -> Self {
        self.options.skip_validation = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&ResilienceError> for ErrorBody {
    fn from(err: &ResilienceError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub service: String,
    pub operation: String,
    pub execution_time_ms: f64,
    pub cache_hit: bool,
    pub trace_id: String,
    pub span_id: String,
    /// Everything validation and rate limiting flagged, blocking or not.
    pub threats: Vec<ThreatEvent>,
}

/// Result of one orchestrated call. Failures are values, never panics or `Err`s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ErrorBody>,
    pub metadata: ResponseMetadata,
}

impl<T> ServiceResponse<T> {
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }

    /// Collapse into a `Result`, keeping the error body.
    pub fn into_result(self) -> Result<T, ErrorBody> {
        match (self.data, self.error) {
            (Some(data), None) => Ok(data),
            (_, Some(error)) => Err(error),
            (None, None) => Err(ErrorBody {
                code: "EMPTY_RESPONSE".into(),
                message: "response carried neither data nor error".into(),
            }),
        }
    }
}
