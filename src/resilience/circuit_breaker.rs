//! Circuit breaker for a single registered service.
//!
//! Three states:
//! - Closed: calls pass through, consecutive failures are counted
//! - Open: calls fail immediately until the open timeout elapses
//! - HalfOpen: exactly one trial call decides between Closed and Open
//!
//! Only the outcome of the future handed to [`CircuitBreaker::call`] is counted, so
//! rejections produced upstream (validation, rate limiting, bulkhead) never trip it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ResilienceError;
use crate::events::{EventSink, ResilienceEvent};
use crate::sync::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive handler failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is admitted.
    pub open_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

/// Point-in-time view used by the metrics API.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Milliseconds until a trial call is admitted; only set while open.
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    next_retry: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    events: EventSink,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig, events: EventSink) -> Self {
        Self {
            service: service.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                next_retry: None,
                trial_in_flight: false,
            }),
            events,
        }
    }

    pub fn state(&self) -> CircuitState {
        lock(&self.state).state
    }

    pub fn failure_count(&self) -> u32 {
        lock(&self.state).consecutive_failures
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = lock(&self.state);
        let retry_in_ms = match (state.state, state.next_retry) {
            (CircuitState::Open, Some(at)) => {
                Some(at.saturating_duration_since(Instant::now()).as_millis() as u64)
            }
            _ => None,
        };
        CircuitSnapshot {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            last_failure_at: state.last_failure_at,
            retry_in_ms,
        }
    }

    /// Force the circuit closed and clear all counters.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        let from = state.state;
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.next_retry = None;
        state.trial_in_flight = false;
        self.transition(from, CircuitState::Closed);
    }

    /// Run `op` under circuit protection.
    ///
    /// `op` is not polled when the call is rejected, so a lazily constructed future
    /// (an `async` block) never reaches the dependency while the circuit is open.
    pub async fn call<T, Fut>(&self, op: Fut) -> Result<T, ResilienceError>
    where
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let trial = self.admit()?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: trial,
        };

        let result = op.await;
        guard.armed = false;

        match &result {
            Ok(_) => self.on_success(trial),
            Err(e) => self.on_failure(trial, e),
        }
        result
    }

    /// Decide whether a call may proceed. Returns `true` when the call is the half-open trial.
    fn admit(&self) -> Result<bool, ResilienceError> {
        let mut state = lock(&self.state);
        match state.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let now = Instant::now();
                match state.next_retry {
                    Some(at) if now < at => Err(ResilienceError::ServiceUnavailable {
                        service: self.service.clone(),
                        reason: format!(
                            "circuit open, retry in {}ms",
                            (at - now).as_millis()
                        ),
                    }),
                    _ => {
                        state.state = CircuitState::HalfOpen;
                        state.trial_in_flight = true;
                        self.transition(CircuitState::Open, CircuitState::HalfOpen);
                        Ok(true)
                    }
                }
            }
            CircuitState::HalfOpen if state.trial_in_flight => {
                Err(ResilienceError::ServiceUnavailable {
                    service: self.service.clone(),
                    reason: "circuit half-open, trial call in progress".into(),
                })
            }
            CircuitState::HalfOpen => {
                state.trial_in_flight = true;
                Ok(true)
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut state = lock(&self.state);
        if trial {
            state.state = CircuitState::Closed;
            state.consecutive_failures = 0;
            state.next_retry = None;
            state.trial_in_flight = false;
            self.transition(CircuitState::HalfOpen, CircuitState::Closed);
        } else if state.state == CircuitState::Closed {
            state.consecutive_failures = 0;
        }
    }

    fn on_failure(&self, trial: bool, error: &ResilienceError) {
        let mut state = lock(&self.state);
        state.last_failure_at = Some(Utc::now());

        if trial {
            state.state = CircuitState::Open;
            state.next_retry = Some(Instant::now() + self.config.open_timeout());
            state.trial_in_flight = false;
            self.transition(CircuitState::HalfOpen, CircuitState::Open);
            return;
        }

        if state.state != CircuitState::Closed {
            // Late completion of a call admitted before the circuit opened.
            return;
        }

        state.consecutive_failures += 1;
        tracing::debug!(
            service = %self.service,
            failures = state.consecutive_failures,
            error = %error,
            "circuit breaker recorded failure"
        );
        if state.consecutive_failures >= self.config.failure_threshold {
            state.state = CircuitState::Open;
            state.next_retry = Some(Instant::now() + self.config.open_timeout());
            self.transition(CircuitState::Closed, CircuitState::Open);
        }
    }

    fn transition(&self, from: CircuitState, to: CircuitState) {
        if from == to {
            return;
        }
        match to {
            CircuitState::Open => {
                tracing::warn!(service = %self.service, %from, %to, "circuit state changed")
            }
            _ => tracing::info!(service = %self.service, %from, %to, "circuit state changed"),
        }
        self.events.emit(ResilienceEvent::CircuitStateChanged {
            service: self.service.clone(),
            from,
            to,
        });
    }
}

/// Frees the half-open slot if the trial future is dropped before it resolves.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.breaker.state).trial_in_flight = false;
        }
    }
}
