//! MCP `invalidate_cache` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `invalidate_cache` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct InvalidateCacheParams {
    /// Tag to invalidate: `service:<name>` or `operation:<name>.<op>`.
    #[schemars(
        description = "Cache tag to invalidate, e.g. 'service:graph' or 'operation:llm.complete'"
    )]
    pub tag: String,
}
