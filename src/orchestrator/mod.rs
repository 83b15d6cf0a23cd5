//! The single entry point for calls to external dependencies.
//!
//! Each registered service gets its own breaker, bulkhead, cache and validator, built
//! from its [`ServiceConfig`]. The rate limiter, profiler, health registry and event
//! channel are shared by all services of one orchestrator.
//!
//! A call goes through these stages, stopping at the first rejection:
//!
//! 1. validation of the payload (high/critical threats block, others are recorded)
//! 2. every rate-limit policy, in order
//! 3. cache lookup keyed by service, operation, payload and caller identity
//! 4. bulkhead, then circuit breaker, then timeout around the handler
//! 5. cache write tagged `service:<name>` and `operation:<name>.<op>`
//!
//! [`ServiceOrchestrator::execute`] never returns an error or panics because of the
//! handler: every failure becomes a failed [`ServiceResponse`] with a stable code.

pub mod health;
pub mod types;

use chrono::Utc;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::field::Empty;
use tracing::Instrument;

use crate::cache::{CacheStats, CleanupReport, IntelligentCache, PrefetchCandidate, SetOptions};
use crate::error::ResilienceError;
use crate::events::{EventSink, ResilienceEvent};
use crate::profiler::{OperationReport, PerformanceProfiler, ProfilerConfig};
use crate::resilience::{Bulkhead, BulkheadSnapshot, CircuitBreaker, CircuitSnapshot, CircuitState};
use crate::security::{
    PurgeReport, RateLimiterSettings, SecurityContext, SecurityRateLimiter, ThreatEvent, Validator,
};
use crate::sync::{read, write};
use health::HealthRegistry;

pub use health::{HealthReport, HealthStatus, ProbeResult};
pub use types::{
    ErrorBody, RequestOptions, ResponseMetadata, ServiceConfig, ServiceRequest, ServiceResponse,
    TraceContext,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// TTL of cached handler responses.
    pub response_ttl_ms: u64,
    pub maintenance_interval_ms: u64,
    pub health_check_timeout_ms: u64,
    pub event_capacity: usize,
    pub rate_limiter: RateLimiterSettings,
    pub profiler: ProfilerConfig,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            response_ttl_ms: 5 * 60 * 1000,
            maintenance_interval_ms: 60_000,
            health_check_timeout_ms: 5_000,
            event_capacity: 256,
            rate_limiter: RateLimiterSettings::default(),
            profiler: ProfilerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestTotals {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub cache_hits: u64,
    /// Rejected by validation or rate limiting.
    pub blocked: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetrics {
    pub service: String,
    pub requests: RequestTotals,
    pub circuit: Option<CircuitSnapshot>,
    pub bulkhead: Option<BulkheadSnapshot>,
    pub cache: Option<CacheStats>,
    /// Profiles of this service's operations, keyed `<service>.<operation>`.
    pub operations: Vec<OperationReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub tracked_operations: usize,
    pub slowest: Vec<OperationReport>,
    pub failing: Vec<OperationReport>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub caches: BTreeMap<String, CleanupReport>,
    pub rate_limiter: PurgeReport,
}

#[derive(Debug, Default)]
struct RequestCounters {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    cache_hits: AtomicU64,
    blocked: AtomicU64,
}

impl RequestCounters {
    fn record<T>(&self, result: &Result<T, ResilienceError>, cache_hit: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(_) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                if cache_hit {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                if matches!(
                    err,
                    ResilienceError::ValidationBlocked { .. } | ResilienceError::RateLimited { .. }
                ) {
                    self.blocked.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn totals(&self) -> RequestTotals {
        RequestTotals {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct ServiceRuntime {
    config: ServiceConfig,
    breaker: Option<CircuitBreaker>,
    bulkhead: Option<Bulkhead>,
    cache: Option<IntelligentCache>,
    validator: Option<Validator>,
    counters: RequestCounters,
}

impl ServiceRuntime {
    fn build(config: ServiceConfig, events: &EventSink) -> Result<Self, ResilienceError> {
        config.check()?;
        let validator = config.validation.as_ref().map(Validator::new).transpose()?;
        let name = config.name.as_str();
        Ok(Self {
            breaker: config
                .circuit_breaker
                .clone()
                .map(|cb| CircuitBreaker::new(name, cb, events.clone())),
            bulkhead: config.bulkhead.clone().map(|bh| Bulkhead::new(name, bh)),
            cache: config
                .cache
                .clone()
                .map(|cache| IntelligentCache::new(name, cache, events.clone())),
            validator,
            counters: RequestCounters::default(),
            config,
        })
    }

    /// Bulkhead outside, breaker inside: a call waiting for a slot is not yet a
    /// breaker attempt, and a breaker rejection frees its slot at once.
    async fn protected<T, Fut>(&self, op: Fut) -> Result<T, ResilienceError>
    where
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let guarded = async {
            match &self.breaker {
                Some(breaker) => breaker.call(op).await,
                None => op.await,
            }
        };
        match &self.bulkhead {
            Some(bulkhead) => bulkhead.run(guarded).await,
            None => guarded.await,
        }
    }
}

/// What the pipeline learned about a call besides its result.
#[derive(Debug, Default)]
struct CallRecord {
    cache_hit: bool,
    threats: Vec<ThreatEvent>,
    response_bytes: usize,
}

#[derive(Debug)]
struct Inner {
    settings: OrchestratorSettings,
    services: RwLock<HashMap<String, Arc<ServiceRuntime>>>,
    limiter: SecurityRateLimiter,
    profiler: PerformanceProfiler,
    health: HealthRegistry,
    events: EventSink,
}

/// Cheap to clone; clones share all state.
#[derive(Debug, Clone)]
pub struct ServiceOrchestrator {
    inner: Arc<Inner>,
}

impl Default for ServiceOrchestrator {
    fn default() -> Self {
        Self::new(OrchestratorSettings::default())
    }
}

impl ServiceOrchestrator {
    pub fn new(settings: OrchestratorSettings) -> Self {
        let events = EventSink::new(settings.event_capacity);
        Self {
            inner: Arc::new(Inner {
                limiter: SecurityRateLimiter::new(settings.rate_limiter.clone(), events.clone()),
                profiler: PerformanceProfiler::new(settings.profiler.clone()),
                health: HealthRegistry::default(),
                services: RwLock::new(HashMap::new()),
                events,
                settings,
            }),
        }
    }

    /// Register `config`, replacing any service with the same name along with its
    /// breaker state and cached responses.
    pub fn register_service(&self, config: ServiceConfig) -> Result<(), ResilienceError> {
        let name = config.name.clone();
        let runtime = Arc::new(ServiceRuntime::build(config, &self.inner.events)?);
        let replaced = write(&self.inner.services)
            .insert(name.clone(), runtime)
            .is_some();
        tracing::info!(service = %name, replaced, "service registered");
        Ok(())
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.inner.services).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn service_config(&self, service: &str) -> Option<ServiceConfig> {
        self.runtime(service).map(|rt| rt.config.clone())
    }

    /// Run `handler` for `service` through the full pipeline.
    ///
    /// The handler receives the (sanitized) payload and the trace context of this
    /// call, which it should propagate to anything it calls in turn. It is not invoked
    /// at all on a cache hit or when an earlier stage rejects the request.
    pub async fn execute<Req, Res, F, Fut>(
        &self,
        service: &str,
        request: ServiceRequest<Req>,
        handler: F,
    ) -> ServiceResponse<Res>
    where
        Req: Serialize + DeserializeOwned,
        Res: Serialize + DeserializeOwned,
        F: FnOnce(Req, TraceContext) -> Fut,
        Fut: Future<Output = anyhow::Result<Res>>,
    {
        let started = Instant::now();
        let trace = TraceContext::child_of(request.trace.as_ref());
        let operation = request.operation.clone();
        let span = tracing::info_span!(
            "service_call",
            service,
            operation = %operation,
            trace_id = %trace.trace_id,
            span_id = %trace.span_id,
            parent_span_id = trace.parent_span_id.as_deref().unwrap_or(""),
            cache_hit = Empty,
            threats = Empty,
            response_bytes = Empty,
            outcome = Empty,
        );

        let mut record = CallRecord::default();
        let result = match self.runtime(service) {
            Some(runtime) => {
                let result = self
                    .run_stages(&runtime, request, handler, trace.clone(), &mut record)
                    .instrument(span.clone())
                    .await;
                runtime.counters.record(&result, record.cache_hit);
                result
            }
            None => Err(ResilienceError::UnknownService(service.to_string())),
        };

        let execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        span.record("cache_hit", record.cache_hit);
        span.record("threats", record.threats.len() as u64);
        span.record("response_bytes", record.response_bytes as u64);

        let metadata = ResponseMetadata {
            service: service.to_string(),
            operation,
            execution_time_ms,
            cache_hit: record.cache_hit,
            trace_id: trace.trace_id,
            span_id: trace.span_id,
            threats: record.threats,
        };
        match result {
            Ok(data) => {
                span.record("outcome", "ok");
                tracing::debug!(parent: &span, execution_time_ms, "service call succeeded");
                ServiceResponse {
                    success: true,
                    data: Some(data),
                    error: None,
                    metadata,
                }
            }
            Err(err) => {
                span.record("outcome", err.code());
                tracing::warn!(parent: &span, code = err.code(), error = %err, "service call failed");
                ServiceResponse {
                    success: false,
                    data: None,
                    error: Some(ErrorBody::from(&err)),
                    metadata,
                }
            }
        }
    }

    async fn run_stages<Req, Res, F, Fut>(
        &self,
        runtime: &ServiceRuntime,
        request: ServiceRequest<Req>,
        handler: F,
        trace: TraceContext,
        record: &mut CallRecord,
    ) -> Result<Res, ResilienceError>
    where
        Req: Serialize + DeserializeOwned,
        Res: Serialize + DeserializeOwned,
        F: FnOnce(Req, TraceContext) -> Fut,
        Fut: Future<Output = anyhow::Result<Res>>,
    {
        let ServiceRequest {
            operation,
            mut payload,
            caller,
            options,
            ..
        } = request;
        let service = runtime.config.name.as_str();

        if !options.skip_validation {
            if let Some(validator) = runtime.validator.as_ref().filter(|v| v.is_enabled()) {
                payload = screen(validator, payload, &mut record.threats)?;
            }
        }

        for policy in &runtime.config.rate_limits {
            let decision = self.inner.limiter.check(policy, &caller);
            record.threats.extend(decision.threat.clone());
            if !decision.allowed {
                return Err(decision.to_error());
            }
        }

        let cached = match runtime.cache.as_ref().filter(|_| !options.skip_cache) {
            Some(cache) => match cache_key(service, &operation, &payload, &caller) {
                Ok(key) => Some((cache, key)),
                Err(err) => {
                    tracing::warn!(error = %err, "bypassing cache");
                    None
                }
            },
            None => None,
        };

        if let Some((cache, key)) = &cached {
            match cache.get::<Res>(key).await {
                Ok(Some(hit)) => {
                    record.cache_hit = true;
                    record.response_bytes = response_size(&hit);
                    return Ok(hit);
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(error = %err, key = %key, "cache read failed, treating as miss"),
            }
        }

        let timeout = options
            .timeout_ms
            .or(runtime.config.timeout_ms)
            .map(Duration::from_millis);
        let profile_key = format!("{service}.{operation}");
        let call = invoke(service, handler, payload, trace, timeout);
        let data = runtime
            .protected(self.inner.profiler.profile(&profile_key, call))
            .await?;
        record.response_bytes = response_size(&data);

        if let Some((cache, key)) = cached {
            let options = SetOptions::default()
                .with_ttl(Duration::from_millis(self.inner.settings.response_ttl_ms))
                .with_tag(format!("service:{service}"))
                .with_tag(format!("operation:{service}.{operation}"));
            if let Err(err) = cache.set(&key, &data, options).await {
                tracing::warn!(error = %err, key = %key, "cache write failed");
            }
        }
        Ok(data)
    }

    pub fn service_metrics(&self, service: Option<&str>) -> Vec<ServiceMetrics> {
        let operations = self.inner.profiler.all();
        self.runtimes()
            .into_iter()
            .filter(|rt| service.is_none_or(|name| rt.config.name == name))
            .map(|rt| {
                let prefix = format!("{}.", rt.config.name);
                ServiceMetrics {
                    service: rt.config.name.clone(),
                    requests: rt.counters.totals(),
                    circuit: rt.breaker.as_ref().map(CircuitBreaker::snapshot),
                    bulkhead: rt.bulkhead.as_ref().map(Bulkhead::snapshot),
                    cache: rt.cache.as_ref().map(IntelligentCache::stats),
                    operations: operations
                        .iter()
                        .filter(|op| op.operation.starts_with(&prefix))
                        .cloned()
                        .collect(),
                }
            })
            .collect()
    }

    /// Register a named probe polled by [`check_health`](Self::check_health).
    pub fn add_health_check<F, Fut>(&self, name: impl Into<String>, probe: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.inner.health.add(name, probe);
    }

    pub async fn check_health(&self) -> HealthReport {
        let timeout = Duration::from_millis(self.inner.settings.health_check_timeout_ms);
        let checks = self.inner.health.run(timeout).await;
        let open_circuits: Vec<String> = self
            .runtimes()
            .iter()
            .filter(|rt| {
                rt.breaker
                    .as_ref()
                    .is_some_and(|b| b.state() != CircuitState::Closed)
            })
            .map(|rt| rt.config.name.clone())
            .collect();

        let status = if checks.iter().any(|c| !c.healthy) {
            HealthStatus::Unhealthy
        } else if !open_circuits.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        HealthReport {
            status,
            checked_at: Utc::now(),
            checks,
            open_circuits,
            blocked_ips: self.inner.limiter.stats().blocked_ips.len(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.inner.events.subscribe()
    }

    /// Drop cached responses carrying `tag` from every service. Returns the number removed.
    pub async fn invalidate_tag(&self, tag: &str) -> usize {
        let mut removed = 0;
        for runtime in self.runtimes() {
            if let Some(cache) = &runtime.cache {
                removed += cache.invalidate_by_tag(tag).await;
            }
        }
        removed
    }

    /// Cache keys of `service` read at regular intervals. Empty when it has no cache.
    pub fn prefetch_candidates(
        &self,
        service: &str,
        limit: usize,
    ) -> Result<Vec<PrefetchCandidate>, ResilienceError> {
        let runtime = self
            .runtime(service)
            .ok_or_else(|| ResilienceError::UnknownService(service.to_string()))?;
        Ok(runtime
            .cache
            .as_ref()
            .map(|cache| cache.prefetch_candidates(limit))
            .unwrap_or_default())
    }

    pub fn performance_report(&self, top: usize, error_rate_threshold: f64) -> PerformanceReport {
        let profiler = &self.inner.profiler;
        PerformanceReport {
            tracked_operations: profiler.all().len(),
            slowest: profiler.slowest(top),
            failing: profiler.above_error_rate(error_rate_threshold),
        }
    }

    /// Force `service`'s breaker closed. Returns `false` when it has no breaker.
    pub fn reset_circuit(&self, service: &str) -> Result<bool, ResilienceError> {
        let runtime = self
            .runtime(service)
            .ok_or_else(|| ResilienceError::UnknownService(service.to_string()))?;
        match &runtime.breaker {
            Some(breaker) => {
                breaker.reset();
                tracing::info!(service, "circuit reset");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// One pass of expiry cleanup over every cache and the rate limiter.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        for runtime in self.runtimes() {
            if let Some(cache) = &runtime.cache {
                let cleanup = cache.cleanup().await;
                report.caches.insert(runtime.config.name.clone(), cleanup);
            }
        }
        report.rate_limiter = self.inner.limiter.purge_expired();
        report
    }

    /// Run [`run_maintenance`](Self::run_maintenance) every `interval` until the
    /// returned handle is shut down or dropped.
    pub fn spawn_maintenance(&self, interval: Duration) -> MaintenanceHandle {
        let (stop_tx, mut stop_rx) = watch::channel(());
        let orchestrator = self.clone();
        let interval = interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = orchestrator.run_maintenance().await;
                        tracing::debug!(?report, "maintenance pass finished");
                    }
                    // Fires on shutdown and when the handle is dropped.
                    _ = stop_rx.changed() => break,
                }
            }
            tracing::info!("maintenance task stopped");
        });

        tracing::info!(interval_ms = interval.as_millis() as u64, "maintenance task started");
        MaintenanceHandle { stop: stop_tx, task }
    }

    fn runtime(&self, service: &str) -> Option<Arc<ServiceRuntime>> {
        read(&self.inner.services).get(service).cloned()
    }

    fn runtimes(&self) -> Vec<Arc<ServiceRuntime>> {
        let mut runtimes: Vec<Arc<ServiceRuntime>> =
            read(&self.inner.services).values().cloned().collect();
        runtimes.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        runtimes
    }
}

/// Stops the background maintenance task.
#[derive(Debug)]
pub struct MaintenanceHandle {
    stop: watch::Sender<()>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Signal the task and wait for its current pass to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "maintenance task ended abnormally");
        }
    }
}

/// Validate and sanitize `payload`, collecting every threat found.
fn screen<T>(
    validator: &Validator,
    payload: T,
    threats: &mut Vec<ThreatEvent>,
) -> Result<T, ResilienceError>
where
    T: Serialize + DeserializeOwned,
{
    let value = serde_json::to_value(&payload).map_err(|e| ResilienceError::ValidationBlocked {
        reason: format!("payload cannot be inspected: {e}"),
    })?;
    let outcome = validator.validate(&value);
    let blocking = outcome
        .blocking_threat()
        .map(|t| format!("{:?} ({:?}): {}", t.kind, t.severity, t.evidence));
    threats.extend(outcome.threats);
    if let Some(reason) = blocking {
        return Err(ResilienceError::ValidationBlocked { reason });
    }
    serde_json::from_value(outcome.sanitized).map_err(|e| ResilienceError::ValidationBlocked {
        reason: format!("sanitized payload no longer matches its type: {e}"),
    })
}

/// Call the handler with panic capture and an optional deadline.
///
/// Nothing runs until the returned future is polled, so a rejected call never
/// reaches the handler.
async fn invoke<Req, Res, F, Fut>(
    service: &str,
    handler: F,
    payload: Req,
    trace: TraceContext,
    timeout: Option<Duration>,
) -> Result<Res, ResilienceError>
where
    F: FnOnce(Req, TraceContext) -> Fut,
    Fut: Future<Output = anyhow::Result<Res>>,
{
    let call = AssertUnwindSafe(async move { handler(payload, trace).await }).catch_unwind();
    let settled = match timeout {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| ResilienceError::Timeout(limit))?,
        None => call.await,
    };
    match settled {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(err)) => Err(ResilienceError::handler_failure(service, format!("{err:#}"))),
        Err(panic) => Err(ResilienceError::handler_failure(
            service,
            format!("handler panicked: {}", panic_message(panic.as_ref())),
        )),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Deterministic key over service, operation, payload and caller identity.
fn cache_key<T: Serialize>(
    service: &str,
    operation: &str,
    payload: &T,
    caller: &SecurityContext,
) -> Result<String, ResilienceError> {
    let body = serde_json::to_vec(payload)
        .map_err(|e| ResilienceError::Cache(format!("payload not serializable: {e}")))?;
    let identity = caller.identity();
    let mut hasher = Sha256::new();
    for part in [service.as_bytes(), operation.as_bytes(), &body, identity.as_bytes()] {
        // Length prefixes keep ("ab", "c") and ("a", "bc") apart.
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    Ok(format!("{service}:{}", hex::encode(hasher.finalize())))
}

fn response_size<T: Serialize>(data: &T) -> usize {
    serde_json::to_vec(data).map(|bytes| bytes.len()).unwrap_or(0)
}
