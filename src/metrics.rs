//! # Statistics and Intra-Process Aggregation
//!
//! Latency bookkeeping for command slots, per-worker results, and the merge of
//! all workers of one process into a [`ProcessSummary`].
//!
//! ## Latency statistics
//!
//! [`LatencyStats`] keeps `min`, `max`, `count` and the running total in
//! nanoseconds. The mean is always derived from total and count, so a mean can
//! never travel without its count and merging is exact: associative and
//! commutative in every field. Recording one sample is the same as the online
//! update `mean' = (delta + count * mean) / (count + 1)` without the rounding
//! drift of an integer running mean.
//!
//! ## Percentiles
//!
//! When latency mode is on, each worker additionally feeds an HDR histogram
//! ([`LatencyCollector`]). Histograms merge losslessly inside a process; they
//! do not cross process boundaries.

use crate::error::BenchError;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Running latency statistics in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyStats {
    min_ns: i64,
    max_ns: i64,
    total_ns: i128,
    count: u64,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyStats {
    /// Empty statistics. `min`/`max` hold sentinels that are never reported.
    pub const fn new() -> Self {
        Self {
            min_ns: i64::MAX,
            max_ns: i64::MIN,
            total_ns: 0,
            count: 0,
        }
    }

    /// Rebuild statistics from a published `(min, max, mean, count)` tuple.
    pub fn from_parts(min_ns: i64, max_ns: i64, mean_ns: i64, count: u64) -> Self {
        if count == 0 {
            return Self::new();
        }
        Self {
            min_ns,
            max_ns,
            total_ns: mean_ns as i128 * count as i128,
            count,
        }
    }

    pub fn record(&mut self, latency_ns: i64) {
        self.min_ns = self.min_ns.min(latency_ns);
        self.max_ns = self.max_ns.max(latency_ns);
        self.total_ns += latency_ns as i128;
        self.count += 1;
    }

    pub fn record_duration(&mut self, latency: Duration) {
        self.record(i64::try_from(latency.as_nanos()).unwrap_or(i64::MAX));
    }

    /// Weighted merge of two sets of statistics.
    pub fn merge(&mut self, other: &LatencyStats) {
        if other.count == 0 {
            return;
        }
        self.min_ns = self.min_ns.min(other.min_ns);
        self.max_ns = self.max_ns.max(other.max_ns);
        self.total_ns += other.total_ns;
        self.count += other.count;
    }

    pub fn merged(mut self, other: &LatencyStats) -> Self {
        self.merge(other);
        self
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn min_ns(&self) -> Option<i64> {
        (self.count > 0).then_some(self.min_ns)
    }

    pub fn max_ns(&self) -> Option<i64> {
        (self.count > 0).then_some(self.max_ns)
    }

    /// Integer mean, truncated toward zero.
    pub fn mean_ns(&self) -> Option<i64> {
        (self.count > 0).then(|| (self.total_ns / self.count as i128) as i64)
    }

    /// `(min, max, mean)` as published, with sentinels when empty.
    pub fn raw_parts(&self) -> (i64, i64, i64) {
        (self.min_ns, self.max_ns, self.mean_ns().unwrap_or(0))
    }
}

/// Percentile value pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileValue {
    pub percentile: f64,
    pub value_ns: u64,
}

/// HDR histogram of per-command latencies.
#[derive(Debug, Clone)]
pub struct LatencyCollector {
    histogram: Histogram<u64>,
}

impl LatencyCollector {
    /// 3 significant figures, auto-resizing.
    pub fn new() -> Result<Self, BenchError> {
        let histogram =
            Histogram::<u64>::new(3).map_err(|e| BenchError::Histogram(e.to_string()))?;
        Ok(Self { histogram })
    }

    pub fn record(&mut self, latency: Duration) -> Result<(), BenchError> {
        let ns = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.histogram
            .record(ns)
            .map_err(|e| BenchError::Histogram(e.to_string()))
    }

    pub fn merge(&mut self, other: &LatencyCollector) -> Result<(), BenchError> {
        self.histogram
            .add(&other.histogram)
            .map_err(|e| BenchError::Histogram(e.to_string()))
    }

    pub fn len(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    pub fn percentiles(&self, percentiles: &[f64]) -> Vec<PercentileValue> {
        if self.is_empty() {
            return Vec::new();
        }
        percentiles
            .iter()
            .map(|&p| PercentileValue {
                percentile: p,
                value_ns: self.histogram.value_at_percentile(p),
            })
            .collect()
    }
}

/// A `[start, end)` interval on the system-wide monotonic clock, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_ns: u64,
    pub end_ns: u64,
}

impl TimeWindow {
    pub fn new(start_ns: u64, end_ns: u64) -> Self {
        Self { start_ns, end_ns }
    }

    /// Earliest start to latest end of both windows.
    pub fn span(&self, other: &TimeWindow) -> TimeWindow {
        TimeWindow {
            start_ns: self.start_ns.min(other.start_ns),
            end_ns: self.end_ns.max(other.end_ns),
        }
    }

    pub fn duration_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_nanos(self.duration_ns())
    }
}

/// What one worker observed.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub worker_id: usize,
    /// Completed commands, failed ones included.
    pub completions: u64,
    pub failures: u64,
    pub latency: LatencyStats,
    pub histogram: Option<LatencyCollector>,
    pub window: TimeWindow,
}

/// Merged result of all workers of one process.
#[derive(Debug, Clone)]
pub struct ProcessSummary {
    pub workers: usize,
    pub completions: u64,
    pub failures: u64,
    pub latency: LatencyStats,
    pub percentiles: Vec<PercentileValue>,
    pub window: TimeWindow,
}

impl ProcessSummary {
    pub fn throughput(&self) -> ThroughputMetrics {
        ThroughputMetrics::new(self.completions, 0, self.window.duration_ns())
    }
}

/// Merge every worker of a process.
///
/// With `expected_total` set (fixed-count mode) the summed completions must
/// match it exactly, otherwise the driver loop miscounted and the run is
/// rejected with [`BenchError::Consistency`].
pub fn aggregate_workers(
    results: Vec<WorkerResult>,
    expected_total: Option<u64>,
    percentiles: &[f64],
) -> Result<ProcessSummary, BenchError> {
    let workers = results.len();
    let mut completions = 0u64;
    let mut failures = 0u64;
    let mut latency = LatencyStats::new();
    let mut window: Option<TimeWindow> = None;
    let mut histogram: Option<LatencyCollector> = None;

    for result in results {
        completions += result.completions;
        failures += result.failures;
        latency.merge(&result.latency);
        window = Some(match window {
            Some(w) => w.span(&result.window),
            None => result.window,
        });
        if let Some(worker_histogram) = result.histogram {
            match histogram.as_mut() {
                Some(merged) => merged.merge(&worker_histogram)?,
                None => histogram = Some(worker_histogram),
            }
        }
    }

    if let Some(expected) = expected_total {
        if completions != expected {
            return Err(BenchError::Consistency {
                expected,
                observed: completions,
            });
        }
    }

    Ok(ProcessSummary {
        workers,
        completions,
        failures,
        latency,
        percentiles: histogram
            .map(|h| h.percentiles(percentiles))
            .unwrap_or_default(),
        window: window.unwrap_or(TimeWindow::new(0, 0)),
    })
}

/// Throughput metrics including operation rate and bandwidth
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputMetrics {
    pub ops_per_second: f64,
    pub bytes_per_second: f64,
    pub total_ops: u64,
    pub total_bytes: u64,
    pub duration_ns: u64,
}

impl ThroughputMetrics {
    pub fn new(total_ops: u64, bytes_per_op: u64, duration_ns: u64) -> Self {
        let total_bytes = total_ops.saturating_mul(bytes_per_op);
        let (ops_per_second, bytes_per_second) = if duration_ns == 0 {
            (0.0, 0.0)
        } else {
            let secs = duration_ns as f64 / 1e9;
            (total_ops as f64 / secs, total_bytes as f64 / secs)
        };
        Self {
            ops_per_second,
            bytes_per_second,
            total_ops,
            total_bytes,
            duration_ns,
        }
    }

    /// Bandwidth in MB/s (10^6 bytes).
    pub fn megabytes_per_second(&self) -> f64 {
        self.bytes_per_second / 1e6
    }
}
