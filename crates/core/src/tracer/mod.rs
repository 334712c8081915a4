//! # Tracer
//!
//! Hierarchical span instrumentation. A span started without a parent opens
//! a new trace; child spans inherit the trace id and record their parent.
//! Finished spans are handed to every registered exporter and kept in a
//! bounded buffer for lookup by trace id.
//!
//! Sampling is decided per trace when its root span starts. Spans of an
//! unsampled trace behave normally for their owner but are dropped at
//! `end_span`.

pub mod exporter;
pub mod metrics;
pub mod span;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

use crate::config::TracingConfig;

pub use exporter::{InMemoryExporter, JsonLinesExporter, LogExporter, SpanExporter};
pub use metrics::{HistogramSummary, MetricsCollector, MetricsSnapshot};
pub use span::{Span, SpanContext, SpanEvent, SpanStatus};

/// Aggregate span statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct TracerStats {
    pub active_spans: usize,
    pub finished_spans: usize,
    pub unsampled_spans: usize,
    pub sample_rate: f64,
    pub error_spans: usize,
    pub traces: usize,
    pub avg_duration_ms: f64,
    pub by_name: HashMap<String, usize>,
}

/// Span factory and collector
pub struct Tracer {
    exporters: RwLock<Vec<Arc<dyn SpanExporter>>>,
    finished: Mutex<VecDeque<Span>>,
    max_finished: usize,
    active: AtomicUsize,
    unsampled: AtomicUsize,
    sample_rate: f64,
    metrics: MetricsCollector,
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl Tracer {
    pub fn new(max_finished: usize) -> Self {
        Self {
            exporters: RwLock::new(Vec::new()),
            finished: Mutex::new(VecDeque::new()),
            max_finished,
            active: AtomicUsize::new(0),
            unsampled: AtomicUsize::new(0),
            sample_rate: 1.0,
            metrics: MetricsCollector::new(),
        }
    }

    /// Fraction of traces to keep, clamped to `0.0..=1.0`
    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = if rate.is_nan() { 1.0 } else { rate.clamp(0.0, 1.0) };
        self
    }

    /// Build a tracer with the exporters named in the config
    pub fn from_config(config: &TracingConfig) -> anyhow::Result<Self> {
        let tracer = Self::new(config.max_finished_spans).with_sample_rate(config.sample_rate);
        if config.log_spans {
            tracer.add_exporter(Arc::new(LogExporter));
        }
        if let Some(path) = &config.jsonl_path {
            tracer.add_exporter(Arc::new(JsonLinesExporter::open(path)?));
        }
        Ok(tracer)
    }

    pub fn add_exporter(&self, exporter: Arc<dyn SpanExporter>) {
        let mut exporters = self.exporters.write().unwrap_or_else(|e| e.into_inner());
        exporters.push(exporter);
    }

    /// Open a span. A `None` parent starts a new trace.
    pub fn start_span(&self, name: &str, parent: Option<&SpanContext>) -> Span {
        let context = match parent {
            Some(parent) => SpanContext::child_of(parent),
            None => SpanContext::sampled_root(self.sample_rate),
        };
        self.active.fetch_add(1, Ordering::SeqCst);
        Span::new(name, context)
    }

    /// Close a span and export it. Exporter failures are logged only.
    pub fn end_span(&self, mut span: Span) {
        if span.is_ended() {
            return;
        }
        span.finish();
        self.active.fetch_sub(1, Ordering::SeqCst);
        if !span.context.sampled {
            self.unsampled.fetch_add(1, Ordering::SeqCst);
            return;
        }

        let exporters: Vec<Arc<dyn SpanExporter>> = self
            .exporters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for exporter in exporters {
            if let Err(e) = exporter.export(&span) {
                tracing::warn!(exporter = exporter.name(), error = %e, "Span export failed");
            }
        }

        if self.max_finished == 0 {
            return;
        }
        let mut finished = self.finished.lock().unwrap_or_else(|e| e.into_inner());
        finished.push_back(span);
        while finished.len() > self.max_finished {
            finished.pop_front();
        }
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Finished spans of one trace, in completion order
    pub fn trace(&self, trace_id: &str) -> Vec<Span> {
        let finished = self.finished.lock().unwrap_or_else(|e| e.into_inner());
        finished
            .iter()
            .filter(|s| s.context.trace_id == trace_id)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> TracerStats {
        let finished = self.finished.lock().unwrap_or_else(|e| e.into_inner());
        let mut stats = TracerStats {
            active_spans: self.active.load(Ordering::SeqCst),
            finished_spans: finished.len(),
            unsampled_spans: self.unsampled.load(Ordering::SeqCst),
            sample_rate: self.sample_rate,
            ..TracerStats::default()
        };

        let mut traces = std::collections::HashSet::new();
        let mut total_ms = 0.0;
        for span in finished.iter() {
            traces.insert(span.context.trace_id.as_str());
            if span.status == SpanStatus::Error {
                stats.error_spans += 1;
            }
            total_ms += span.duration_ms.unwrap_or_default();
            *stats.by_name.entry(span.name.clone()).or_insert(0) += 1;
        }
        stats.traces = traces.len();
        if !finished.is_empty() {
            stats.avg_duration_ms = total_ms / finished.len() as f64;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_child_spans_share_trace() {
        let tracer = Tracer::default();
        let memory = Arc::new(InMemoryExporter::new());
        tracer.add_exporter(memory.clone());

        let root = tracer.start_span("run", None);
        let mut child = tracer.start_span("node.build", Some(&root.context));
        child.set_attribute("node", "build");
        child.set_ok();
        let trace_id = root.trace_id().to_string();

        assert_eq!(tracer.stats().active_spans, 2);
        tracer.end_span(child);
        tracer.end_span(root);

        let spans = tracer.trace(&trace_id);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].name, "node.build");
        assert_eq!(
            spans[0].context.parent_span_id.as_deref(),
            Some(spans[1].span_id())
        );
        assert_eq!(memory.spans().len(), 2);
        assert_eq!(tracer.stats().active_spans, 0);
    }

    struct BrokenExporter;

    impl SpanExporter for BrokenExporter {
        fn name(&self) -> &str {
            "broken"
        }

        fn export(&self, _span: &Span) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    #[test]
    fn test_exporter_failure_is_isolated() {
        let tracer = Tracer::default();
        let memory = Arc::new(InMemoryExporter::new());
        tracer.add_exporter(Arc::new(BrokenExporter));
        tracer.add_exporter(memory.clone());

        let mut span = tracer.start_span("tool.validate", None);
        span.set_error("checks failed");
        tracer.end_span(span);

        assert_eq!(memory.spans().len(), 1);
        let stats = tracer.stats();
        assert_eq!(stats.error_spans, 1);
        assert_eq!(stats.traces, 1);
        assert_eq!(stats.by_name.get("tool.validate"), Some(&1));
    }

    #[test]
    fn test_unsampled_traces_are_not_exported() {
        let tracer = Tracer::default().with_sample_rate(0.0);
        let memory = Arc::new(InMemoryExporter::new());
        tracer.add_exporter(memory.clone());

        let root = tracer.start_span("run", None);
        let mut child = tracer.start_span("node.a", Some(&root.context));
        assert!(!child.context.sampled);
        child.set_attribute("node", "a");
        let trace_id = root.trace_id().to_string();
        tracer.end_span(child);
        tracer.end_span(root);

        assert!(memory.spans().is_empty());
        assert!(tracer.trace(&trace_id).is_empty());
        let stats = tracer.stats();
        assert_eq!(stats.active_spans, 0);
        assert_eq!(stats.unsampled_spans, 2);
        assert_eq!(stats.sample_rate, 0.0);
    }

    #[test]
    fn test_sample_rate_comes_from_config() {
        let config = TracingConfig {
            sample_rate: 2.5,
            ..TracingConfig::default()
        };
        let tracer = Tracer::from_config(&config).unwrap();
        assert_eq!(tracer.stats().sample_rate, 1.0);
        let span = tracer.start_span("run", None);
        assert!(span.context.sampled);
        tracer.end_span(span);
        assert_eq!(tracer.stats().finished_spans, 1);
    }
}
