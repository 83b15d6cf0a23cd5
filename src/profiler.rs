//! Latency and error-rate profiling per named operation.
//!
//! Percentiles come from a bounded sample buffer: once it grows past
//! `max_samples` it is trimmed to the newest `trim_to` durations, so they describe
//! recent behavior rather than the whole process lifetime.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ResilienceError;
use crate::sync::lock;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    pub max_samples: usize,
    pub trim_to: usize,
    /// Calls after which the error rate stops being a plain mean and starts
    /// discounting older outcomes.
    pub error_window: u64,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            max_samples: 1000,
            trim_to: 500,
            error_window: 100,
        }
    }
}

impl ProfilerConfig {
    /// Reject buffer sizes that would leave nothing to compute percentiles from.
    pub fn check(&self) -> Result<(), ResilienceError> {
        if self.max_samples == 0 || self.trim_to == 0 || self.trim_to > self.max_samples {
            return Err(ResilienceError::InvalidConfig(format!(
                "profiler: need 0 < trim_to ({}) <= max_samples ({})",
                self.trim_to, self.max_samples
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OperationReport {
    pub operation: String,
    pub count: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub total_ms: f64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Default)]
struct OperationStats {
    count: u64,
    errors: u64,
    error_rate: f64,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
    /// Milliseconds, oldest first.
    samples: Vec<f64>,
}

#[derive(Debug, Default)]
pub struct PerformanceProfiler {
    config: ProfilerConfig,
    operations: Mutex<HashMap<String, OperationStats>>,
}

impl PerformanceProfiler {
    pub fn new(config: ProfilerConfig) -> Self {
        Self {
            config,
            operations: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, operation: &str, duration: Duration, success: bool) {
        let mut operations = lock(&self.operations);
        let stats = operations.entry(operation.to_string()).or_default();

        stats.count += 1;
        stats.total += duration;
        stats.min = Some(stats.min.map_or(duration, |min| min.min(duration)));
        stats.max = stats.max.max(duration);

        let outcome = if success { 0.0 } else { 1.0 };
        if !success {
            stats.errors += 1;
        }
        let weight = stats.count.min(self.config.error_window.max(1)) as f64;
        stats.error_rate += (outcome - stats.error_rate) / weight;

        stats.samples.push(duration.as_secs_f64() * 1000.0);
        if stats.samples.len() > self.config.max_samples {
            let keep = self.config.trim_to.min(self.config.max_samples).max(1);
            let excess = stats.samples.len() - keep;
            stats.samples.drain(..excess);
        }
    }

    /// Time `fut` and record it; an `Err` output counts as a failure.
    pub async fn profile<T, E, Fut>(&self, operation: &str, fut: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let result = fut.await;
        self.record(operation, started.elapsed(), result.is_ok());
        result
    }

    pub fn report(&self, operation: &str) -> Option<OperationReport> {
        lock(&self.operations)
            .get(operation)
            .map(|stats| build_report(operation, stats))
    }

    pub fn all(&self) -> Vec<OperationReport> {
        let mut reports: Vec<OperationReport> = lock(&self.operations)
            .iter()
            .map(|(name, stats)| build_report(name, stats))
            .collect();
        reports.sort_by(|a, b| a.operation.cmp(&b.operation));
        reports
    }

    /// The `n` operations with the highest average latency.
    pub fn slowest(&self, n: usize) -> Vec<OperationReport> {
        let mut reports = self.all();
        reports.sort_by(|a, b| b.avg_ms.total_cmp(&a.avg_ms));
        reports.truncate(n);
        reports
    }

    /// Operations whose error rate is above `threshold` (0.0 to 1.0), worst first.
    pub fn above_error_rate(&self, threshold: f64) -> Vec<OperationReport> {
        let mut reports: Vec<OperationReport> = self
            .all()
            .into_iter()
            .filter(|r| r.error_rate > threshold)
            .collect();
        reports.sort_by(|a, b| b.error_rate.total_cmp(&a.error_rate));
        reports
    }
}

fn build_report(operation: &str, stats: &OperationStats) -> OperationReport {
    let mut sorted = stats.samples.clone();
    sorted.sort_by(f64::total_cmp);

    let ms = |d: Duration| d.as_secs_f64() * 1000.0;
    let total_ms = ms(stats.total);
    OperationReport {
        operation: operation.to_string(),
        count: stats.count,
        errors: stats.errors,
        error_rate: stats.error_rate,
        total_ms,
        avg_ms: if stats.count == 0 { 0.0 } else { total_ms / stats.count as f64 },
        min_ms: stats.min.map(ms).unwrap_or(0.0),
        max_ms: ms(stats.max),
        p50_ms: percentile(&sorted, 50.0),
        p95_ms: percentile(&sorted, 95.0),
        p99_ms: percentile(&sorted, 99.0),
    }
}

/// Nearest-rank percentile over an ascending slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn tracks_counts_and_extremes() {
        let profiler = PerformanceProfiler::default();
        profiler.record("graph.query", ms(10), true);
        profiler.record("graph.query", ms(30), true);
        profiler.record("graph.query", ms(20), false);

        let report = profiler.report("graph.query").unwrap();
        assert_eq!(report.count, 3);
        assert_eq!(report.errors, 1);
        assert_eq!(report.min_ms, 10.0);
        assert_eq!(report.max_ms, 30.0);
        assert_eq!(report.avg_ms, 20.0);
        assert!((report.error_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn percentiles_use_nearest_rank() {
        let profiler = PerformanceProfiler::default();
        for i in 1..=100 {
            profiler.record("llm.complete", ms(i), true);
        }
        let report = profiler.report("llm.complete").unwrap();
        assert_eq!(report.p50_ms, 50.0);
        assert_eq!(report.p95_ms, 95.0);
        assert_eq!(report.p99_ms, 99.0);
    }

    #[test]
    fn samples_are_trimmed_to_the_newest() {
        let profiler = PerformanceProfiler::new(ProfilerConfig {
            max_samples: 10,
            trim_to: 5,
            error_window: 100,
        });
        for i in 1..=11 {
            profiler.record("kv.get", ms(i), true);
        }
        // Samples 7..=11 remain; min/max still cover the lifetime.
        let report = profiler.report("kv.get").unwrap();
        assert_eq!(report.p50_ms, 9.0);
        assert_eq!(report.min_ms, 1.0);
        assert_eq!(report.count, 11);
    }

    #[test]
    fn trim_target_above_the_cap_is_clamped() {
        let config = ProfilerConfig {
            max_samples: 10,
            trim_to: 20,
            error_window: 100,
        };
        assert_eq!(config.check().unwrap_err().code(), "INVALID_CONFIG");

        let profiler = PerformanceProfiler::new(config);
        for i in 1..=11 {
            profiler.record("kv.get", ms(i), true);
        }
        // Trimmed to the cap: samples 2..=11 remain.
        let report = profiler.report("kv.get").unwrap();
        assert_eq!(report.count, 11);
        assert_eq!(report.p50_ms, 6.0);

        assert!(ProfilerConfig::default().check().is_ok());
        let empty = ProfilerConfig {
            trim_to: 0,
            ..ProfilerConfig::default()
        };
        assert!(empty.check().is_err());
    }

    #[test]
    fn error_rate_discounts_old_outcomes_past_the_window() {
        let profiler = PerformanceProfiler::new(ProfilerConfig {
            error_window: 4,
            ..ProfilerConfig::default()
        });
        for _ in 0..4 {
            profiler.record("op", ms(1), false);
        }
        profiler.record("op", ms(1), true);
        // 1.0 moved a quarter of the way toward 0.0.
        let report = profiler.report("op").unwrap();
        assert!((report.error_rate - 0.75).abs() < 1e-9);
    }

    #[test]
    fn dashboards_queries() {
        let profiler = PerformanceProfiler::default();
        profiler.record("fast", ms(1), true);
        profiler.record("slow", ms(500), false);
        profiler.record("medium", ms(50), true);

        let slowest: Vec<_> = profiler.slowest(2).into_iter().map(|r| r.operation).collect();
        assert_eq!(slowest, vec!["slow", "medium"]);

        let failing = profiler.above_error_rate(0.5);
        assert_eq!(failing.len(), 1);
        assert_eq!(failing[0].operation, "slow");
    }

    #[tokio::test]
    async fn profile_records_outcome() {
        let profiler = PerformanceProfiler::default();
        let _ = profiler.profile("op", async { Err::<(), _>("nope") }).await;
        assert_eq!(profiler.report("op").unwrap().errors, 1);
    }
}
