//! MCP `performance_report` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `performance_report` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct PerformanceReportParams {
    /// How many of the slowest operations to list. Defaults to 5.
    #[schemars(description = "Number of slowest operations to list. Defaults to 5.")]
    pub top: Option<usize>,

    /// Operations failing more often than this (0.0 to 1.0) are listed. Defaults to 0.1.
    #[schemars(
        description = "List operations whose error rate exceeds this threshold (0.0-1.0). Defaults to 0.1."
    )]
    pub error_rate_threshold: Option<f64>,
}
