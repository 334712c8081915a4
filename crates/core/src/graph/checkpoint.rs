//! # Checkpoints
//!
//! Versioned snapshots of a run taken at node boundaries. Fields added
//! after version 1 default when absent so older records still load.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::GraphState;
use crate::error::{KernelError, KernelResult};

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    /// `<run_id>:<step>`
    pub id: String,
    pub run_id: String,
    pub phase: String,
    pub completed_nodes: Vec<String>,
    pub state: GraphState,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
    /// Nodes activated but not yet completed
    #[serde(default)]
    pub frontier: Vec<String>,
    #[serde(default)]
    pub status: CheckpointStatus,
    #[serde(default)]
    pub step: usize,
    /// A finish point has completed
    #[serde(default)]
    pub finished: bool,
    /// Join targets with the plain predecessors that already completed
    #[serde(default)]
    pub pending_joins: BTreeMap<String, BTreeSet<String>>,
}

impl Checkpoint {
    pub(crate) fn capture(
        state: &GraphState,
        frontier: Vec<String>,
        status: CheckpointStatus,
        finished: bool,
        pending_joins: BTreeMap<String, BTreeSet<String>>,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            id: format!("{}:{}", state.run_id, state.step),
            run_id: state.run_id.clone(),
            phase: state.phase.clone(),
            completed_nodes: state.completed.iter().cloned().collect(),
            state: state.clone(),
            retry_count: state.retry_count,
            timestamp: Utc::now(),
            frontier,
            status,
            step: state.step,
            finished,
            pending_joins,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != CheckpointStatus::Running
    }
}

/// Persistence for checkpoints. Implementations must be safe to share
/// across runs.
pub trait CheckpointStore: Send + Sync {
    /// Insert or replace by checkpoint id
    fn save(&self, checkpoint: &Checkpoint) -> KernelResult<()>;

    fn load(&self, id: &str) -> KernelResult<Checkpoint>;

    /// Highest-step checkpoint of a run
    fn latest(&self, run_id: &str) -> KernelResult<Option<Checkpoint>>;

    /// All checkpoints of a run, oldest first
    fn list(&self, run_id: &str) -> KernelResult<Vec<Checkpoint>>;

    /// Run ids with at least one checkpoint
    fn runs(&self) -> KernelResult<Vec<String>>;
}

/// Process-local checkpoint store
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    runs: Mutex<BTreeMap<String, BTreeMap<usize, Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> KernelResult<()> {
        let mut runs = self.runs.lock().map_err(KernelError::lock)?;
        runs.entry(checkpoint.run_id.clone())
            .or_default()
            .insert(checkpoint.step, checkpoint.clone());
        Ok(())
    }

    fn load(&self, id: &str) -> KernelResult<Checkpoint> {
        let runs = self.runs.lock().map_err(KernelError::lock)?;
        runs.values()
            .flat_map(|cps| cps.values())
            .find(|cp| cp.id == id)
            .cloned()
            .ok_or_else(|| KernelError::NotFound(format!("checkpoint '{}'", id)))
    }

    fn latest(&self, run_id: &str) -> KernelResult<Option<Checkpoint>> {
        let runs = self.runs.lock().map_err(KernelError::lock)?;
        Ok(runs
            .get(run_id)
            .and_then(|cps| cps.values().next_back())
            .cloned())
    }

    fn list(&self, run_id: &str) -> KernelResult<Vec<Checkpoint>> {
        let runs = self.runs.lock().map_err(KernelError::lock)?;
        Ok(runs
            .get(run_id)
            .map(|cps| cps.values().cloned().collect())
            .unwrap_or_default())
    }

    fn runs(&self) -> KernelResult<Vec<String>> {
        let runs = self.runs.lock().map_err(KernelError::lock)?;
        Ok(runs.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_is_highest_step() {
        let store = InMemoryCheckpointStore::new();
        let mut state = GraphState::new("run-1");
        for step in 1..=3 {
            state.step = step;
            store
                .save(&Checkpoint::capture(
                    &state,
                    vec![],
                    CheckpointStatus::Running,
                    false,
                    BTreeMap::new(),
                ))
                .unwrap();
        }

        let latest = store.latest("run-1").unwrap().unwrap();
        assert_eq!(latest.id, "run-1:3");
        assert_eq!(store.list("run-1").unwrap().len(), 3);
        assert_eq!(store.load("run-1:2").unwrap().step, 2);
        assert!(store.latest("other").unwrap().is_none());
        assert_eq!(store.runs().unwrap(), vec!["run-1".to_string()]);
    }

    #[test]
    fn test_loads_record_without_optional_fields() {
        let json = serde_json::json!({
            "version": 1,
            "id": "r:2",
            "run_id": "r",
            "phase": "building",
            "completed_nodes": ["a", "b"],
            "state": { "run_id": "r", "phase": "building" },
            "retry_count": 0,
            "timestamp": "2024-01-01T00:00:00Z"
        });
        let cp: Checkpoint = serde_json::from_value(json).unwrap();
        assert!(cp.frontier.is_empty());
        assert_eq!(cp.status, CheckpointStatus::Running);
        assert!(!cp.finished);
    }
}
