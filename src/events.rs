//! Observable events emitted by the resilience components.
//!
//! Components hold an [`EventSink`] (a cloned broadcast sender) handed to them by the
//! orchestrator that owns them. Nobody is required to listen: sending with no
//! subscribers is a no-op.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::resilience::circuit_breaker::CircuitState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResilienceEvent {
    CircuitStateChanged {
        service: String,
        from: CircuitState,
        to: CircuitState,
    },
    CacheEvicted {
        key: String,
        /// `true` when the entry was hot enough to be compressed into L2 instead of dropped.
        demoted: bool,
    },
    CacheInvalidated {
        tag: String,
        removed: usize,
    },
    RateLimitViolation {
        policy: String,
        key: String,
        violations: u32,
    },
    IpBlocked {
        ip: String,
        duration_ms: u64,
    },
    IpUnblocked {
        ip: String,
    },
    CleanupCompleted {
        component: String,
        removed: usize,
    },
}

#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<ResilienceEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: ResilienceEvent) {
        tracing::trace!(?event, "resilience event");
        // Err only means there are no subscribers right now.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(256)
    }
}
