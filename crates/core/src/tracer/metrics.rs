//! # Metrics
//!
//! Counters, gauges and histograms keyed by metric name plus tags.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;

/// Summary of one histogram
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl HistogramSummary {
    fn of(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let count = sorted.len();
        let max = sorted[count - 1];
        // Upper percentiles need enough samples to mean anything
        let percentile = |p: f64, min_samples: usize| {
            if count >= min_samples {
                sorted[((count as f64 * p) as usize).min(count - 1)]
            } else {
                max
            }
        };
        Some(Self {
            count,
            min: sorted[0],
            max,
            avg: sorted.iter().sum::<f64>() / count as f64,
            p50: sorted[count / 2],
            p95: percentile(0.95, 20),
            p99: percentile(0.99, 100),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub histograms: BTreeMap<String, HistogramSummary>,
}

#[derive(Default)]
struct Series {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
    histograms: BTreeMap<String, Vec<f64>>,
}

#[derive(Default)]
pub struct MetricsCollector {
    series: Mutex<Series>,
}

/// `name` alone, or `name{k1=v1,k2=v2}` with tags sorted by key
pub fn metric_key(name: &str, tags: &[(&str, &str)]) -> String {
    if tags.is_empty() {
        return name.to_string();
    }
    let mut tags = tags.to_vec();
    tags.sort();
    let joined: Vec<String> = tags.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{}{{{}}}", name, joined.join(","))
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &str, value: u64, tags: &[(&str, &str)]) {
        let key = metric_key(name, tags);
        let mut series = self.series.lock().unwrap_or_else(|e| e.into_inner());
        *series.counters.entry(key).or_insert(0) += value;
    }

    pub fn gauge(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        let key = metric_key(name, tags);
        let mut series = self.series.lock().unwrap_or_else(|e| e.into_inner());
        series.gauges.insert(key, value);
    }

    pub fn histogram(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        let key = metric_key(name, tags);
        let mut series = self.series.lock().unwrap_or_else(|e| e.into_inner());
        series.histograms.entry(key).or_default().push(value);
    }

    pub fn counter(&self, key: &str) -> u64 {
        let series = self.series.lock().unwrap_or_else(|e| e.into_inner());
        series.counters.get(key).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let series = self.series.lock().unwrap_or_else(|e| e.into_inner());
        MetricsSnapshot {
            counters: series.counters.clone(),
            gauges: series.gauges.clone(),
            histograms: series
                .histograms
                .iter()
                .filter_map(|(key, values)| HistogramSummary::of(values).map(|h| (key.clone(), h)))
                .collect(),
        }
    }

    pub fn reset(&self) {
        let mut series = self.series.lock().unwrap_or_else(|e| e.into_inner());
        *series = Series::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_sort_tags() {
        assert_eq!(metric_key("tool.calls", &[]), "tool.calls");
        assert_eq!(
            metric_key("tool.calls", &[("tool", "build"), ("status", "ok")]),
            "tool.calls{status=ok,tool=build}"
        );
    }

    #[test]
    fn test_counters_and_gauges() {
        let metrics = MetricsCollector::new();
        metrics.increment("node.completed", 1, &[("node", "a")]);
        metrics.increment("node.completed", 2, &[("node", "a")]);
        metrics.gauge("queue.depth", 3.0, &[]);
        metrics.gauge("queue.depth", 1.0, &[]);

        assert_eq!(metrics.counter("node.completed{node=a}"), 3);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.gauges["queue.depth"], 1.0);

        metrics.reset();
        assert!(metrics.snapshot().counters.is_empty());
    }

    #[test]
    fn test_histogram_percentiles_need_samples() {
        let metrics = MetricsCollector::new();
        for v in [5.0, 1.0, 3.0] {
            metrics.histogram("latency", v, &[]);
        }
        let small = metrics.snapshot().histograms["latency"].clone();
        assert_eq!(small.count, 3);
        assert_eq!(small.min, 1.0);
        assert_eq!(small.p50, 3.0);
        assert_eq!(small.avg, 3.0);
        assert_eq!(small.p95, 5.0);
        assert_eq!(small.p99, 5.0);

        metrics.reset();
        for v in 1..=100 {
            metrics.histogram("latency", v as f64, &[]);
        }
        let large = metrics.snapshot().histograms["latency"].clone();
        assert_eq!(large.p50, 51.0);
        assert_eq!(large.p95, 96.0);
        assert_eq!(large.p99, 100.0);
        assert_eq!(large.max, 100.0);
    }
}
