use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;

/// Samples the scheduler reports about each computer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Metric {
    /// Wall time of one `work()` invocation, in nanoseconds.
    ComputerTasks,
    /// Bytes allocated by the worker thread while running a computer.
    ThreadAllocation,
}

impl Metric {
    pub fn name(self) -> &'static str {
        match self {
            Self::ComputerTasks => "computer_tasks",
            Self::ThreadAllocation => "thread_allocation",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Self::ComputerTasks => "ns",
            Self::ThreadAllocation => "bytes",
        }
    }
}

/// Receives metric samples. A side channel only: nothing observed here
/// influences scheduling.
pub trait MetricsObserver: Send + Sync {
    fn observe(&self, metric: Metric, value: u64);
}

/// Discards every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsObserver for NoopMetrics {
    fn observe(&self, _metric: Metric, _value: u64) {}
}

/// Running totals for one metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricSummary {
    pub count: u64,
    pub total: u64,
    pub max: u64,
    /// Rolling mean of all samples.
    pub mean: f64,
}

impl MetricSummary {
    fn record(&mut self, value: u64) {
        self.count += 1;
        self.total = self.total.saturating_add(value);
        self.max = self.max.max(value);

        // Incremental mean: new_avg = prev_avg + (value - prev_avg) / count
        self.mean += (value as f64 - self.mean) / self.count as f64;
    }
}

/// A [`MetricsObserver`] which aggregates samples per metric.
#[derive(Debug, Default)]
pub struct AggregateMetrics {
    summaries: Mutex<BTreeMap<Metric, MetricSummary>>,
}

impl AggregateMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Summary for one metric (all zero if never observed).
    pub fn get(&self, metric: Metric) -> MetricSummary {
        self.summaries.lock().get(&metric).copied().unwrap_or_default()
    }

    /// Snapshot keyed by metric name, suitable for serialization.
    pub fn snapshot(&self) -> BTreeMap<&'static str, MetricSummary> {
        self.summaries
            .lock()
            .iter()
            .map(|(metric, summary)| (metric.name(), *summary))
            .collect()
    }
}

impl MetricsObserver for AggregateMetrics {
    fn observe(&self, metric: Metric, value: u64) {
        self.summaries.lock().entry(metric).or_default().record(value);
    }
}
