//! MCP `service_metrics` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `service_metrics` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ServiceMetricsParams {
    /// Limit the report to one service. Omit for all services.
    #[schemars(description = "Optional service name (e.g. 'graph', 'llm'). Omit for all services.")]
    pub service: Option<String>,
}
