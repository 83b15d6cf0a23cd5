//! Fixed-window rate limiting with escalating temporary blocks.
//!
//! Each `(policy, derived key)` pair gets its own window. Exceeding the window is a
//! violation; more than `block_after_violations` consecutive violations blocks the
//! caller's IP for `min(violations * block_step, max_block)`. While blocked, every
//! request from that IP is rejected before any window is consulted. Callers without
//! a known address are never blocked, only limited.
//!
//! A check-and-increment runs under one lock with no await, so it is atomic per call.
//! Separate pipelines racing on the same key may still interleave; limits are
//! approximate under heavy concurrency.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::{SecurityContext, Severity, ThreatEvent, ThreatKind};
use crate::error::ResilienceError;
use crate::events::{EventSink, ResilienceEvent};
use crate::sync::lock;

/// How a policy derives its bucket key from the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    #[default]
    Ip,
    User,
    Session,
    IpAndUser,
    /// One bucket shared by every caller.
    Global,
}

impl KeyStrategy {
    pub fn derive(&self, ctx: &SecurityContext) -> String {
        let or_anon = |v: &Option<String>| v.clone().unwrap_or_else(|| "anonymous".into());
        match self {
            Self::Ip => match (&ctx.ip, &ctx.session_id) {
                (Some(ip), _) => ip.clone(),
                (None, Some(session)) => format!("session:{session}"),
                (None, None) => "unknown".into(),
            },
            Self::User => or_anon(&ctx.user_id),
            Self::Session => or_anon(&ctx.session_id),
            Self::IpAndUser => format!("{}+{}", ctx.ip_or_unknown(), or_anon(&ctx.user_id)),
            Self::Global => "*".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub name: String,
    pub window_ms: u64,
    pub max_requests: u32,
    #[serde(default)]
    pub key: KeyStrategy,
}

impl RateLimitPolicy {
    pub fn new(name: impl Into<String>, window: Duration, max_requests: u32) -> Self {
        Self {
            name: name.into(),
            window_ms: window.as_millis() as u64,
            max_requests,
            key: KeyStrategy::Ip,
        }
    }

    pub fn keyed_by(mut self, key: KeyStrategy) -> Self {
        self.key = key;
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterSettings {
    /// Consecutive violations tolerated before the IP is blocked.
    pub block_after_violations: u32,
    /// Block length added per violation.
    pub block_step_ms: u64,
    pub max_block_ms: u64,
    /// Recent allow/deny outcomes kept per window.
    pub outcome_history: usize,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            block_after_violations: 5,
            block_step_ms: 60_000,
            max_block_ms: 600_000,
            outcome_history: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub policy: String,
    pub remaining: u32,
    /// Time until the window resets or the block lifts.
    pub retry_after: Duration,
    pub threat: Option<ThreatEvent>,
}

impl RateDecision {
    pub fn to_error(&self) -> ResilienceError {
        ResilienceError::RateLimited {
            policy: self.policy.clone(),
            remaining: self.remaining,
            retry_after_ms: self.retry_after.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PurgeReport {
    pub windows_removed: usize,
    pub unblocked: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub tracked_windows: usize,
    /// Share of denied requests among the recent outcomes of every live window.
    pub recent_denial_ratio: f64,
    pub blocked_ips: Vec<BlockedIp>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockedIp {
    pub ip: String,
    pub remaining_ms: u64,
}

#[derive(Debug)]
struct RateWindow {
    count: u32,
    reset_at: Instant,
    /// `true` for allowed requests, newest last.
    outcomes: VecDeque<bool>,
    consecutive_violations: u32,
}

#[derive(Debug, Default)]
struct LimiterState {
    windows: HashMap<String, RateWindow>,
    blocks: HashMap<String, Instant>,
}

#[derive(Debug)]
pub struct SecurityRateLimiter {
    settings: RateLimiterSettings,
    state: Mutex<LimiterState>,
    events: EventSink,
}

impl SecurityRateLimiter {
    pub fn new(settings: RateLimiterSettings, events: EventSink) -> Self {
        Self {
            settings,
            state: Mutex::new(LimiterState::default()),
            events,
        }
    }

    pub fn check(&self, policy: &RateLimitPolicy, ctx: &SecurityContext) -> RateDecision {
        let now = Instant::now();
        let ip = ctx.ip.as_deref();
        let mut state = lock(&self.state);

        if let Some((ip, until)) = ip.and_then(|ip| state.blocks.get(ip).map(|&until| (ip, until))) {
            if now < until {
                let remaining_block = until - now;
                tracing::debug!(ip, policy = %policy.name, remaining_ms = remaining_block.as_millis() as u64, "request from blocked ip rejected");
                return RateDecision {
                    allowed: false,
                    policy: policy.name.clone(),
                    remaining: 0,
                    retry_after: remaining_block,
                    threat: Some(ThreatEvent::new(
                        ThreatKind::TemporaryBlock,
                        Severity::Medium,
                        format!("ip {ip} is temporarily blocked"),
                        true,
                    )),
                };
            }
            state.blocks.remove(ip);
        }

        let key = format!("{}:{}", policy.name, policy.key.derive(ctx));
        let window = state.windows.entry(key.clone()).or_insert_with(|| RateWindow {
            count: 0,
            reset_at: now + policy.window(),
            outcomes: VecDeque::new(),
            consecutive_violations: 0,
        });

        if now >= window.reset_at {
            window.count = 0;
            window.consecutive_violations = 0;
            window.reset_at = now + policy.window();
            window.outcomes.clear();
        }

        let history = self.settings.outcome_history;
        let push_outcome = |window: &mut RateWindow, allowed: bool| {
            window.outcomes.push_back(allowed);
            while window.outcomes.len() > history {
                window.outcomes.pop_front();
            }
        };

        if window.count < policy.max_requests {
            window.count += 1;
            window.consecutive_violations = 0;
            push_outcome(window, true);
            return RateDecision {
                allowed: true,
                policy: policy.name.clone(),
                remaining: policy.max_requests - window.count,
                retry_after: Duration::ZERO,
                threat: None,
            };
        }

        window.consecutive_violations += 1;
        push_outcome(window, false);
        let violations = window.consecutive_violations;
        let window_reset = window.reset_at - now;

        self.events.emit(ResilienceEvent::RateLimitViolation {
            policy: policy.name.clone(),
            key: key.clone(),
            violations,
        });

        if let Some(ip) = ip.filter(|_| violations > self.settings.block_after_violations) {
            let block = self.block_duration(violations);
            state.blocks.insert(ip.to_string(), now + block);
            tracing::warn!(ip, policy = %policy.name, violations, block_ms = block.as_millis() as u64, "ip temporarily blocked");
            self.events.emit(ResilienceEvent::IpBlocked {
                ip: ip.to_string(),
                duration_ms: block.as_millis() as u64,
            });
            return RateDecision {
                allowed: false,
                policy: policy.name.clone(),
                remaining: 0,
                retry_after: block,
                threat: Some(ThreatEvent::new(
                    ThreatKind::BruteForce,
                    Severity::High,
                    format!("{violations} consecutive violations of '{}' from {ip}", policy.name),
                    true,
                )),
            };
        }

        tracing::info!(key = %key, violations, "rate limit exceeded");
        RateDecision {
            allowed: false,
            policy: policy.name.clone(),
            remaining: 0,
            retry_after: window_reset,
            threat: Some(ThreatEvent::new(
                ThreatKind::RateLimitExceeded,
                Severity::Medium,
                format!("{} requests per {}ms exceeded for {key}", policy.max_requests, policy.window_ms),
                true,
            )),
        }
    }

    /// Escalating block length: one step per violation, capped.
    pub fn block_duration(&self, violations: u32) -> Duration {
        let ms = (violations as u64)
            .saturating_mul(self.settings.block_step_ms)
            .min(self.settings.max_block_ms);
        Duration::from_millis(ms)
    }

    pub fn is_blocked(&self, ip: &str) -> bool {
        lock(&self.state)
            .blocks
            .get(ip)
            .is_some_and(|until| Instant::now() < *until)
    }

    /// Drop expired windows and lift expired blocks.
    pub fn purge_expired(&self) -> PurgeReport {
        let now = Instant::now();
        let report = {
            let mut state = lock(&self.state);
            let before = state.windows.len();
            state.windows.retain(|_, window| now < window.reset_at);
            let windows_removed = before - state.windows.len();

            let unblocked: Vec<String> = state
                .blocks
                .iter()
                .filter(|(_, until)| now >= **until)
                .map(|(ip, _)| ip.clone())
                .collect();
            for ip in &unblocked {
                state.blocks.remove(ip);
            }
            PurgeReport {
                windows_removed,
                unblocked,
            }
        };

        for ip in &report.unblocked {
            tracing::info!(ip = %ip, "ip block expired");
            self.events.emit(ResilienceEvent::IpUnblocked { ip: ip.clone() });
        }
        self.events.emit(ResilienceEvent::CleanupCompleted {
            component: "rate_limiter".into(),
            removed: report.windows_removed + report.unblocked.len(),
        });
        report
    }

    pub fn stats(&self) -> LimiterStats {
        let now = Instant::now();
        let state = lock(&self.state);
        let mut blocked_ips: Vec<BlockedIp> = state
            .blocks
            .iter()
            .filter(|(_, until)| now < **until)
            .map(|(ip, until)| BlockedIp {
                ip: ip.clone(),
                remaining_ms: (*until - now).as_millis() as u64,
            })
            .collect();
        blocked_ips.sort_by(|a, b| a.ip.cmp(&b.ip));

        let (denied, total) = state
            .windows
            .values()
            .flat_map(|window| window.outcomes.iter())
            .fold((0usize, 0usize), |(denied, total), allowed| {
                (denied + usize::from(!allowed), total + 1)
            });
        LimiterStats {
            tracked_windows: state.windows.len(),
            recent_denial_ratio: if total == 0 {
                0.0
            } else {
                denied as f64 / total as f64
            },
            blocked_ips,
        }
    }
}
