//! MCP `prefetch_candidates` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `prefetch_candidates` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct PrefetchCandidatesParams {
    #[schemars(description = "Service whose cache access patterns to analyze")]
    pub service: String,

    /// Maximum candidates to return (1 to 100). Defaults to 10.
    #[schemars(description = "Maximum number of candidates (1-100). Defaults to 10.")]
    pub limit: Option<usize>,
}
