//! Access-pattern tracking for prefetch hints.
//!
//! A key is "predictable" when the standard deviation of its inter-access intervals is
//! below `predictability_ratio` times their mean. The ratio defaults to 0.2; it is an
//! empirical heuristic and is exposed as configuration rather than treated as fixed.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PrefetchCandidate {
    pub key: String,
    pub access_count: usize,
    pub mean_interval_ms: f64,
    pub stddev_interval_ms: f64,
}

#[derive(Debug)]
pub struct AccessPatterns {
    history: HashMap<String, VecDeque<Instant>>,
    capacity: usize,
    predictability_ratio: f64,
}

impl AccessPatterns {
    pub fn new(capacity: usize, predictability_ratio: f64) -> Self {
        Self {
            history: HashMap::new(),
            capacity: capacity.max(2),
            predictability_ratio,
        }
    }

    pub fn record(&mut self, key: &str, at: Instant) {
        let history = self.history.entry(key.to_string()).or_default();
        history.push_back(at);
        while history.len() > self.capacity {
            history.pop_front();
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.history.len()
    }

    /// Drop accesses older than `retention`; keys left with no history are forgotten.
    /// Returns the number of forgotten keys.
    pub fn prune(&mut self, now: Instant, retention: Duration) -> usize {
        let before = self.history.len();
        self.history.retain(|_, accesses| {
            while accesses
                .front()
                .is_some_and(|at| now.saturating_duration_since(*at) > retention)
            {
                accesses.pop_front();
            }
            !accesses.is_empty()
        });
        before - self.history.len()
    }

    /// Predictable keys ranked by access count, most frequent first.
    pub fn prefetch_candidates(&self, limit: usize) -> Vec<PrefetchCandidate> {
        let mut candidates: Vec<PrefetchCandidate> = self
            .history
            .iter()
            .filter_map(|(key, accesses)| {
                let (mean, stddev) = interval_stats(accesses)?;
                (mean > 0.0 && stddev < self.predictability_ratio * mean).then(|| {
                    PrefetchCandidate {
                        key: key.clone(),
                        access_count: accesses.len(),
                        mean_interval_ms: mean,
                        stddev_interval_ms: stddev,
                    }
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.access_count
                .cmp(&a.access_count)
                .then_with(|| a.key.cmp(&b.key))
        });
        candidates.truncate(limit);
        candidates
    }
}

/// Mean and population standard deviation of the gaps between accesses, in ms.
/// Needs at least two intervals to say anything.
fn interval_stats(accesses: &VecDeque<Instant>) -> Option<(f64, f64)> {
    if accesses.len() < 3 {
        return None;
    }
    let intervals: Vec<f64> = accesses
        .iter()
        .zip(accesses.iter().skip(1))
        .map(|(a, b)| b.saturating_duration_since(*a).as_secs_f64() * 1000.0)
        .collect();
    let n = intervals.len() as f64;
    let mean = intervals.iter().sum::<f64>() / n;
    let variance = intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance.sqrt()))
}
