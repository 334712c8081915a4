//! # Kernel Events
//!
//! Event types published on the [`EventBus`](super::EventBus).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of kernel event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Graph execution started (fresh or resumed)
    RunStarted,
    /// Graph execution reached a finish point
    RunCompleted,
    /// Graph execution aborted
    RunFailed,
    /// Node handler dispatched
    NodeStarted,
    /// Node handler finished and its update was merged
    NodeCompleted,
    /// Node handler failed, timed out or wrote outside its schema
    NodeFailed,
    /// A BEFORE_EXECUTE hook refused continuation
    NodeSkipped,
    /// Checkpoint persisted at a node boundary
    CheckpointSaved,
    /// Pipeline entered a new phase
    PhaseEntered,
    /// Tool finished with a successful result
    ToolInvoked,
    /// Tool finished with an error, timeout or contract violation
    ToolFailed,
    /// Memory entry stored
    MemoryStored,
    /// Memory entry deleted
    MemoryDeleted,
    /// Application-defined event
    Custom(String),
}

impl EventKind {
    /// Stable dotted name used in logs
    pub fn name(&self) -> String {
        match self {
            Self::RunStarted => "run.started".to_string(),
            Self::RunCompleted => "run.completed".to_string(),
            Self::RunFailed => "run.failed".to_string(),
            Self::NodeStarted => "node.started".to_string(),
            Self::NodeCompleted => "node.completed".to_string(),
            Self::NodeFailed => "node.failed".to_string(),
            Self::NodeSkipped => "node.skipped".to_string(),
            Self::CheckpointSaved => "checkpoint.saved".to_string(),
            Self::PhaseEntered => "phase.entered".to_string(),
            Self::ToolInvoked => "tool.invoked".to_string(),
            Self::ToolFailed => "tool.failed".to_string(),
            Self::MemoryStored => "memory.stored".to_string(),
            Self::MemoryDeleted => "memory.deleted".to_string(),
            Self::Custom(name) => format!("custom.{}", name),
        }
    }
}

/// An event on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID
    pub id: String,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Kind of event
    pub kind: EventKind,
    /// Component or node that produced this event
    pub source: String,
    /// Associated data (JSON)
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Event {
    /// Create a new event
    pub fn new(kind: EventKind, source: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            source: source.to_string(),
            data: serde_json::Value::Null,
        }
    }

    /// Add data to the event
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Read a string field from the payload
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = Event::new(EventKind::NodeStarted, "analyzing")
            .with_data(serde_json::json!({ "node": "analyzing" }));

        assert_eq!(event.source, "analyzing");
        assert_eq!(event.data_str("node"), Some("analyzing"));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&EventKind::PhaseEntered).unwrap();
        assert_eq!(json, "\"phase_entered\"");
        assert_eq!(EventKind::Custom("x".into()).name(), "custom.x");
    }
}
