//! Bounded-concurrency isolation for a single service.
//!
//! A call runs immediately while fewer than `max_concurrency` calls are in flight,
//! otherwise it waits in a queue of at most `queue_depth` callers. A full queue
//! rejects immediately with [`ResilienceError::CapacityExceeded`]. The slot is an owned
//! semaphore permit, so it is released however the call settles, including when the
//! caller drops the future.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::error::ResilienceError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    pub max_concurrency: usize,
    pub queue_depth: usize,
    /// Give up waiting for a slot after this long. `None` waits indefinitely.
    pub queue_timeout_ms: Option<u64>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            queue_depth: 50,
            queue_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkheadSnapshot {
    pub active: usize,
    pub queued: usize,
    pub max_concurrency: usize,
    pub queue_depth: usize,
    pub admitted_total: u64,
    pub rejected_total: u64,
}

#[derive(Debug)]
pub struct Bulkhead {
    service: String,
    config: BulkheadConfig,
    permits: Arc<Semaphore>,
    queued: AtomicUsize,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl Bulkhead {
    pub fn new(service: impl Into<String>, config: BulkheadConfig) -> Self {
        Self {
            service: service.into(),
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            queued: AtomicUsize::new(0),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn active(&self) -> usize {
        self.config.max_concurrency - self.permits.available_permits()
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> BulkheadSnapshot {
        BulkheadSnapshot {
            active: self.active(),
            queued: self.queued(),
            max_concurrency: self.config.max_concurrency,
            queue_depth: self.config.queue_depth,
            admitted_total: self.admitted.load(Ordering::Relaxed),
            rejected_total: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Run `op` once a slot is available.
    pub async fn run<T, Fut>(&self, op: Fut) -> Result<T, ResilienceError>
    where
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let queue = self.enqueue()?;
                let acquire = Arc::clone(&self.permits).acquire_owned();
                let acquired = match self.config.queue_timeout_ms {
                    Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), acquire).await {
                        Ok(acquired) => acquired,
                        Err(_) => {
                            drop(queue);
                            return Err(self.reject());
                        }
                    },
                    None => acquire.await,
                };
                drop(queue);
                // The semaphore is never closed while the bulkhead is alive.
                acquired.map_err(|_| self.reject())?
            }
        };

        self.admitted.fetch_add(1, Ordering::Relaxed);
        let result = op.await;
        drop(permit);
        result
    }

    fn enqueue(&self) -> Result<QueueSlot<'_>, ResilienceError> {
        let depth = self.config.queue_depth;
        let reserved = self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                (queued < depth).then_some(queued + 1)
            });
        match reserved {
            Ok(_) => Ok(QueueSlot {
                queued: &self.queued,
            }),
            Err(_) => Err(self.reject()),
        }
    }

    fn reject(&self) -> ResilienceError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        let err = ResilienceError::CapacityExceeded {
            service: self.service.clone(),
            active: self.active(),
            queued: self.queued(),
        };
        tracing::warn!(service = %self.service, %err, "bulkhead rejected call");
        err
    }
}

/// Holds a place in the wait queue until dropped.
struct QueueSlot<'a> {
    queued: &'a AtomicUsize,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }
}
