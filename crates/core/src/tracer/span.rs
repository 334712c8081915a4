//! # Spans
//!
//! Units of timed work, linked into traces through [`SpanContext`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Completion status of a span
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error,
}

/// Identity of a span within its trace
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    /// Decided once per trace; unsampled spans are never exported
    #[serde(default = "always")]
    pub sampled: bool,
}

fn always() -> bool {
    true
}

impl SpanContext {
    #[cfg(test)]
    pub(crate) fn root() -> Self {
        Self::sampled_root(1.0)
    }

    /// Open a trace that is sampled with probability `rate`
    pub(crate) fn sampled_root(rate: f64) -> Self {
        let trace = uuid::Uuid::new_v4();
        // Low 53 bits of a v4 uuid are all random
        let bits = trace.as_u128() as u64 & ((1u64 << 53) - 1);
        let fraction = bits as f64 / (1u64 << 53) as f64;
        Self {
            trace_id: trace.simple().to_string(),
            span_id: new_span_id(),
            parent_span_id: None,
            sampled: rate >= 1.0 || fraction < rate,
        }
    }

    pub(crate) fn child_of(parent: &SpanContext) -> Self {
        Self {
            trace_id: parent.trace_id.clone(),
            span_id: new_span_id(),
            parent_span_id: Some(parent.span_id.clone()),
            sampled: parent.sampled,
        }
    }
}

fn new_span_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..16].to_string()
}

/// Timestamped annotation inside a span
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// A traced operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub context: SpanContext,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<f64>,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub events: Vec<SpanEvent>,
    #[serde(default)]
    pub status: SpanStatus,
    pub status_message: Option<String>,
}

impl Span {
    pub(crate) fn new(name: &str, context: SpanContext) -> Self {
        Self {
            context,
            name: name.to_string(),
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            attributes: BTreeMap::new(),
            events: Vec::new(),
            status: SpanStatus::Unset,
            status_message: None,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.context.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.context.span_id
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    pub fn add_event(&mut self, name: &str, attributes: BTreeMap<String, serde_json::Value>) {
        self.events.push(SpanEvent {
            name: name.to_string(),
            timestamp: Utc::now(),
            attributes,
        });
    }

    pub fn set_ok(&mut self) {
        self.status = SpanStatus::Ok;
        self.status_message = None;
    }

    /// Mark the span failed and record the message as an `exception` event
    pub fn set_error(&mut self, message: &str) {
        self.status = SpanStatus::Error;
        self.status_message = Some(message.to_string());
        let mut attrs = BTreeMap::new();
        attrs.insert("message".to_string(), serde_json::Value::from(message));
        self.add_event("exception", attrs);
    }

    pub fn is_ended(&self) -> bool {
        self.end_time.is_some()
    }

    pub(crate) fn finish(&mut self) {
        if self.is_ended() {
            return;
        }
        let end = Utc::now();
        let micros = (end - self.start_time).num_microseconds().unwrap_or(0);
        self.duration_ms = Some(micros as f64 / 1000.0);
        self.end_time = Some(end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_inherits_trace() {
        let root = SpanContext::root();
        let child = SpanContext::child_of(&root);
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(root.span_id.as_str()));
        assert_ne!(child.span_id, root.span_id);
        assert!(child.sampled);
    }

    #[test]
    fn test_sampling_extremes_and_inheritance() {
        for _ in 0..50 {
            assert!(SpanContext::sampled_root(1.0).sampled);
            let dropped = SpanContext::sampled_root(0.0);
            assert!(!dropped.sampled);
            assert!(!SpanContext::child_of(&dropped).sampled);
        }
    }

    #[test]
    fn test_error_records_exception_event() {
        let mut span = Span::new("tool.build", SpanContext::root());
        span.set_error("compile failed");
        assert_eq!(span.status, SpanStatus::Error);
        assert_eq!(span.events[0].name, "exception");

        span.finish();
        let first_end = span.end_time;
        span.finish();
        assert_eq!(span.end_time, first_end);
        assert!(span.duration_ms.unwrap() >= 0.0);
    }
}
