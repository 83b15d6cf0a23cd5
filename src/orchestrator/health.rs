//! Named boolean health probes, polled on demand.

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

use crate::sync::{read, write};

type Probe = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Every probe passed but at least one circuit is not closed.
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub name: String,
    pub healthy: bool,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub checks: Vec<ProbeResult>,
    /// Services whose breaker is open or half-open.
    pub open_circuits: Vec<String>,
    pub blocked_ips: usize,
}

#[derive(Default)]
pub struct HealthRegistry {
    probes: RwLock<BTreeMap<String, Probe>>,
}

impl std::fmt::Debug for HealthRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthRegistry")
            .field("probes", &read(&self.probes).keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HealthRegistry {
    /// Register `probe` under `name`, replacing any probe with the same name.
    pub fn add<F, Fut>(&self, name: impl Into<String>, probe: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let probe = Arc::new(probe);
        // The user closure only runs once the future is polled, inside the unwind guard.
        let probe: Probe = Arc::new(move || {
            let probe = Arc::clone(&probe);
            async move { probe().await }.boxed()
        });
        write(&self.probes).insert(name.into(), probe);
    }

    pub fn len(&self) -> usize {
        read(&self.probes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every probe concurrently. A probe that times out or panics is unhealthy.
    pub async fn run(&self, timeout: Duration) -> Vec<ProbeResult> {
        let probes: Vec<(String, Probe)> = read(&self.probes)
            .iter()
            .map(|(name, probe)| (name.clone(), Arc::clone(probe)))
            .collect();

        join_all(probes.into_iter().map(|(name, probe)| async move {
            let started = Instant::now();
            let outcome = tokio::time::timeout(timeout, AssertUnwindSafe(probe()).catch_unwind()).await;
            let (healthy, error) = match outcome {
                Ok(Ok(true)) => (true, None),
                Ok(Ok(false)) => (false, Some("probe reported unhealthy".to_string())),
                Ok(Err(_)) => (false, Some("probe panicked".to_string())),
                Err(_) => (false, Some(format!("timed out after {}ms", timeout.as_millis()))),
            };
            if !healthy {
                tracing::warn!(probe = %name, error = error.as_deref().unwrap_or(""), "health probe failed");
            }
            ProbeResult {
                name,
                healthy,
                latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                error,
            }
        }))
        .await
    }
}
