//! Request screening: payload validation and per-caller rate limiting.
//!
//! Both produce [`ThreatEvent`]s, which the orchestrator attaches to the response
//! metadata whether or not the request was allowed through.

pub mod rate_limiter;
pub mod validation;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use rate_limiter::{
    KeyStrategy, LimiterStats, PurgeReport, RateDecision, RateLimitPolicy, RateLimiterSettings,
    SecurityRateLimiter,
};
pub use validation::{PatternSpec, ValidationConfig, ValidationOutcome, Validator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High and critical threats stop the request.
    pub fn blocks(&self) -> bool {
        *self >= Severity::High
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatKind {
    RateLimitExceeded,
    BruteForce,
    TemporaryBlock,
    ScriptInjection,
    SqlInjection,
    CypherInjection,
    PathTraversal,
    CommandInjection,
    PromptInjection,
    OversizedPayload,
    /// Matched a pattern supplied in the service's validation config.
    CustomPattern,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatEvent {
    pub kind: ThreatKind,
    pub severity: Severity,
    pub evidence: String,
    pub blocked: bool,
    pub detected_at: DateTime<Utc>,
}

impl ThreatEvent {
    pub fn new(kind: ThreatKind, severity: Severity, evidence: impl Into<String>, blocked: bool) -> Self {
        Self {
            kind,
            severity,
            evidence: evidence.into(),
            blocked,
            detected_at: Utc::now(),
        }
    }
}

/// Who is calling, as far as the transport can tell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub ip: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub user_agent: Option<String>,
}

impl SecurityContext {
    /// The peer address, or `unknown` when the transport has none.
    pub fn ip_or_unknown(&self) -> &str {
        self.ip.as_deref().unwrap_or("unknown")
    }

    /// Stable caller identity folded into cache keys.
    pub fn identity(&self) -> String {
        format!(
            "{}|{}|{}",
            self.user_id.as_deref().unwrap_or("-"),
            self.session_id.as_deref().unwrap_or("-"),
            self.ip.as_deref().unwrap_or("-"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_drives_blocking() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High.blocks());
        assert!(Severity::Critical.blocks());
        assert!(!Severity::Medium.blocks());
        assert!(!Severity::Low.blocks());
    }

    #[test]
    fn identity_distinguishes_callers() {
        let a = SecurityContext {
            ip: Some("10.0.0.1".into()),
            user_id: Some("ana".into()),
            ..Default::default()
        };
        let b = SecurityContext {
            user_id: Some("ana".into()),
            ..Default::default()
        };
        assert_ne!(a.identity(), b.identity());
        assert_eq!(b.ip_or_unknown(), "unknown");
    }
}
