pub mod health_status;
pub mod invalidate_cache;
pub mod performance_report;
pub mod prefetch_candidates;
pub mod service_metrics;
pub mod text_statistics;

use anyhow::Context;
use axum::extract::ConnectInfo;
use axum::http::request::Parts;
use health_status::HealthStatusParams;
use invalidate_cache::InvalidateCacheParams;
use performance_report::PerformanceReportParams;
use prefetch_candidates::PrefetchCandidatesParams;
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::Extensions;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use serde::Serialize;
use service_metrics::ServiceMetricsParams;
use std::net::SocketAddr;
use text_statistics::{TextStatisticsInput, TextStatisticsParams};
use uuid::Uuid;

use crate::orchestrator::{ServiceOrchestrator, ServiceRequest};
use crate::security::SecurityContext;

/// Service that runs the `text_statistics` analysis.
pub const ANALYSIS_SERVICE: &str = "analysis";

/// The Quire MCP tool handler. Holds the shared orchestrator and the identity of the
/// connected client, and exposes all MCP tools via the `#[tool_router]` macro.
#[derive(Clone)]
pub struct QuireTools {
    tool_router: ToolRouter<Self>,
    orchestrator: ServiceOrchestrator,
    caller: SecurityContext,
}

#[tool_router]
impl QuireTools {
    /// One handler per client session; each gets its own session id for rate limiting.
    pub fn new(orchestrator: ServiceOrchestrator) -> Self {
        Self {
            tool_router: Self::tool_router(),
            orchestrator,
            caller: SecurityContext {
                session_id: Some(Uuid::now_v7().to_string()),
                user_agent: Some("mcp".into()),
                ..SecurityContext::default()
            },
        }
    }

    /// Analyze a passage of prose through the resilient `analysis` service.
    #[tool(description = "Compute prose statistics for a passage: word, sentence and paragraph counts, average sentence length, reading time and most frequent words. Results are cached.")]
    async fn text_statistics(
        &self,
        Parameters(params): Parameters<TextStatisticsParams>,
        extensions: Extensions,
    ) -> Result<String, String> {
        if params.text.trim().is_empty() {
            return Err("text must not be empty".into());
        }
        let top_words = params.top_words.unwrap_or(10);
        if !(1..=50).contains(&top_words) {
            return Err("top_words must be between 1 and 50".into());
        }

        tracing::info!(text_len = params.text.len(), top_words, "text_statistics called");

        let request = ServiceRequest::new(
            "text_statistics",
            TextStatisticsInput {
                text: params.text,
                top_words,
            },
        )
        .from_caller(self.caller_from(&extensions));

        let response = self
            .orchestrator
            .execute(ANALYSIS_SERVICE, request, |input, trace| async move {
                tracing::debug!(trace_id = %trace.trace_id, "running text analysis");
                // CPU-bound on long manuscripts
                tokio::task::spawn_blocking(move || {
                    text_statistics::compute_statistics(&input.text, input.top_words)
                })
                .await
                .context("analysis task failed")
            })
            .await;

        match &response.error {
            Some(error) => Err(format!(
                "{}: {} (trace {})",
                error.code, error.message, response.metadata.trace_id
            )),
            None => to_json(&response),
        }
    }

    /// Report resilience metrics per service.
    #[tool(description = "Get resilience metrics per service: circuit breaker state, bulkhead occupancy, cache hit rate and size, request counts and latency percentiles.")]
    async fn service_metrics(
        &self,
        Parameters(params): Parameters<ServiceMetricsParams>,
    ) -> Result<String, String> {
        tracing::info!(service = ?params.service, "service_metrics called");
        let metrics = self.orchestrator.service_metrics(params.service.as_deref());
        if let Some(service) = &params.service {
            if metrics.is_empty() {
                return Err(format!("service '{service}' is not registered"));
            }
        }
        to_json(&metrics)
    }

    /// Run every registered health probe.
    #[tool(description = "Check health: runs all registered probes and lists services whose circuit is not closed.")]
    async fn health_status(
        &self,
        Parameters(_params): Parameters<HealthStatusParams>,
    ) -> Result<String, String> {
        tracing::info!("health_status called");
        to_json(&self.orchestrator.check_health().await)
    }

    /// Drop cached responses by tag.
    #[tool(description = "Invalidate cached responses by tag, e.g. 'service:graph' or 'operation:analysis.text_statistics'.")]
    async fn invalidate_cache(
        &self,
        Parameters(params): Parameters<InvalidateCacheParams>,
    ) -> Result<String, String> {
        if params.tag.trim().is_empty() {
            return Err("tag must not be empty".into());
        }
        let removed = self.orchestrator.invalidate_tag(&params.tag).await;
        tracing::info!(tag = %params.tag, removed, "invalidate_cache called");
        to_json(&serde_json::json!({ "tag": params.tag, "removed": removed }))
    }

    /// List cache keys with regular access intervals.
    #[tool(description = "List cache keys of a service that are read at regular intervals and are worth prefetching.")]
    async fn prefetch_candidates(
        &self,
        Parameters(params): Parameters<PrefetchCandidatesParams>,
    ) -> Result<String, String> {
        let limit = params.limit.unwrap_or(10);
        if !(1..=100).contains(&limit) {
            return Err("limit must be between 1 and 100".into());
        }
        tracing::info!(service = %params.service, limit, "prefetch_candidates called");
        let candidates = self
            .orchestrator
            .prefetch_candidates(&params.service, limit)
            .map_err(|e| e.to_string())?;
        to_json(&candidates)
    }

    /// Summarize the slowest and most failure-prone operations.
    #[tool(description = "Performance report: the slowest operations by average latency and the operations whose error rate exceeds a threshold.")]
    async fn performance_report(
        &self,
        Parameters(params): Parameters<PerformanceReportParams>,
    ) -> Result<String, String> {
        let top = params.top.unwrap_or(5);
        let threshold = params.error_rate_threshold.unwrap_or(0.1);
        if !(0.0..=1.0).contains(&threshold) {
            return Err("error_rate_threshold must be between 0.0 and 1.0".into());
        }
        tracing::info!(top, threshold, "performance_report called");
        to_json(&self.orchestrator.performance_report(top, threshold))
    }
}

impl QuireTools {
    /// This session's identity plus the peer address when the request came over HTTP.
    fn caller_from(&self, extensions: &Extensions) -> SecurityContext {
        SecurityContext {
            ip: peer_ip(extensions),
            ..self.caller.clone()
        }
    }
}

/// The Streamable HTTP transport stores the request head in the extensions; axum adds
/// the socket address when served with connect info.
fn peer_ip(extensions: &Extensions) -> Option<String> {
    let parts = extensions.get::<Parts>()?;
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

fn to_json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| format!("serialization failed: {e}"))
}

#[tool_handler]
impl ServerHandler for QuireTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "Quire is a resilient backend for writing assistance. Use text_statistics to \
                 analyze prose, service_metrics and health_status to inspect dependencies, \
                 and invalidate_cache after the underlying data changes."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}
