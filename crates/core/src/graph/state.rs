//! # Graph State
//!
//! The blackboard shared by every node of a run, plus run metadata.
//! Handlers never touch it directly: they receive a [`StateView`] of their
//! declared reads and return a [`StateUpdate`] that the executor merges.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::tracer::SpanContext;

/// Phase recorded before any handler sets one
pub const INITIAL_PHASE: &str = "init";

/// One recorded node failure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeError {
    pub node_id: String,
    pub phase: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphState {
    pub run_id: String,
    pub phase: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,
    /// Nodes that completed at least once
    #[serde(default)]
    pub completed: BTreeSet<String>,
    #[serde(default)]
    pub failed: BTreeSet<String>,
    /// Node ids in completion order
    #[serde(default)]
    pub execution_path: Vec<String>,
    #[serde(default)]
    pub errors: Vec<NodeError>,
    /// Node outcomes processed so far
    #[serde(default)]
    pub step: usize,
}

impl GraphState {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            phase: INITIAL_PHASE.to_string(),
            retry_count: 0,
            data: BTreeMap::new(),
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            execution_path: Vec::new(),
            errors: Vec::new(),
            step: 0,
        }
    }

    /// Seed a value
    pub fn with(mut self, key: &str, value: serde_json::Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub(crate) fn view(&self, node_id: &str, reads: &BTreeSet<String>, span: Option<SpanContext>) -> StateView {
        let data = reads
            .iter()
            .filter_map(|k| self.data.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        StateView {
            node_id: node_id.to_string(),
            run_id: self.run_id.clone(),
            phase: self.phase.clone(),
            retry_count: self.retry_count,
            step: self.step,
            data,
            span,
        }
    }

    /// Apply an already-validated update
    pub(crate) fn merge(&mut self, update: StateUpdate) {
        if let Some(phase) = update.phase {
            self.phase = phase;
        }
        if let Some(retry_count) = update.retry_count {
            self.retry_count = retry_count;
        }
        self.data.extend(update.values);
    }

    pub(crate) fn record_error(&mut self, node_id: &str, message: &str) {
        self.errors.push(NodeError {
            node_id: node_id.to_string(),
            phase: self.phase.clone(),
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }
}

/// Read-only input handed to a node handler
#[derive(Debug, Clone)]
pub struct StateView {
    pub node_id: String,
    pub run_id: String,
    pub phase: String,
    pub retry_count: u32,
    pub step: usize,
    data: BTreeMap<String, serde_json::Value>,
    span: Option<SpanContext>,
}

impl StateView {
    /// Value of a declared read key, if present
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Value of a declared read key, failing if absent
    pub fn require(&self, key: &str) -> anyhow::Result<&serde_json::Value> {
        self.data
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("Node '{}' requires missing key '{}'", self.node_id, key))
    }

    /// Deserialize a declared read key
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        let value = self.require(key)?.clone();
        serde_json::from_value(value)
            .map_err(|e| anyhow::anyhow!("Key '{}' has unexpected shape: {}", key, e))
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// All visible keys as a JSON object
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(self.data.clone().into_iter().collect())
    }

    /// Span of the running node, for nesting tool spans
    pub fn span(&self) -> Option<&SpanContext> {
        self.span.as_ref()
    }
}

/// Partial update returned by a node handler
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub(crate) values: BTreeMap<String, serde_json::Value>,
    pub(crate) phase: Option<String>,
    pub(crate) retry_count: Option<u32>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a key. The key must be in the node's declared write set.
    pub fn set(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    /// Write any serializable value
    pub fn set_json<T: Serialize>(self, key: &str, value: &T) -> anyhow::Result<Self> {
        Ok(self.set(key, serde_json::to_value(value)?))
    }

    pub fn with_phase(mut self, phase: &str) -> Self {
        self.phase = Some(phase.to_string());
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.phase.is_none() && self.retry_count.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_exposes_only_declared_reads() {
        let state = GraphState::new("r")
            .with("visible", serde_json::json!(1))
            .with("hidden", serde_json::json!(2));
        let reads: BTreeSet<String> = ["visible".to_string(), "absent".to_string()].into();

        let view = state.view("n", &reads, None);
        assert_eq!(view.get("visible"), Some(&serde_json::json!(1)));
        assert!(view.get("hidden").is_none());
        assert!(view.require("absent").is_err());
        assert_eq!(view.run_id, "r");
    }

    #[test]
    fn test_merge_applies_values_and_metadata() {
        let mut state = GraphState::new("r");
        state.merge(
            StateUpdate::new()
                .set("a", 1)
                .with_phase("building")
                .with_retry_count(2),
        );
        assert_eq!(state.phase, "building");
        assert_eq!(state.retry_count, 2);
        assert_eq!(state.get("a"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn test_state_tolerates_missing_fields() {
        let state: GraphState =
            serde_json::from_str(r#"{ "run_id": "r", "phase": "init" }"#).unwrap();
        assert!(state.data.is_empty());
        assert_eq!(state.step, 0);
    }
}
