//! # Kernel Errors
//!
//! Error taxonomy shared by every kernel component.
//!
//! Handler and tool code works with `anyhow::Result`; whatever crosses a
//! kernel boundary (graph construction, execution, registries, memory,
//! storage) is reported as a [`KernelError`].

use std::time::Duration;

use thiserror::Error;

use crate::graph::GraphState;

/// Result alias for kernel operations
pub type KernelResult<T> = std::result::Result<T, KernelError>;

/// Why a node did not produce a usable update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The handler returned an error
    Handler(String),
    /// The handler exceeded its time budget
    Timeout(Duration),
    /// The handler wrote a key outside its declared write set
    UndeclaredWrite(String),
    /// The handler task panicked
    Panicked(String),
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handler(msg) => write!(f, "{}", msg),
            Self::Timeout(after) => write!(f, "timed out after {:?}", after),
            Self::UndeclaredWrite(key) => write!(f, "wrote undeclared key '{}'", key),
            Self::Panicked(msg) => write!(f, "handler panicked: {}", msg),
        }
    }
}

/// Context attached to every execution failure surfaced to the caller
#[derive(Debug, Clone)]
pub struct ExecutionFailure {
    /// Node that failed
    pub node_id: String,
    /// Phase recorded in the state when the node failed
    pub phase: String,
    /// Retry counter at the time of failure
    pub retry_count: u32,
    /// Underlying cause
    pub cause: FailureCause,
    /// State of the last persisted checkpoint
    pub state: GraphState,
}

/// Errors raised by the orchestration kernel
#[derive(Debug, Error)]
pub enum KernelError {
    /// Malformed graph detected at build time. Never retried.
    #[error("Graph validation failed: {0}")]
    GraphValidation(String),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Tool '{0}' is already registered")]
    DuplicateTool(String),

    #[error("Tool '{0}' not found")]
    ToolNotFound(String),

    /// Memory entry (or fact, episode, checkpoint) is absent or expired
    #[error("Not found: {0}")]
    NotFound(String),

    /// A node handler failed and no failure edge recovered it
    #[error("Node '{}' failed in phase '{}' (retry {}): {}", .0.node_id, .0.phase, .0.retry_count, .0.cause)]
    GraphExecution(Box<ExecutionFailure>),

    /// A node exceeded its time budget and no failure edge recovered it
    #[error("Node '{}' timed out in phase '{}' (retry {}): {}", .0.node_id, .0.phase, .0.retry_count, .0.cause)]
    Timeout(Box<ExecutionFailure>),

    /// Loop guard tripped
    #[error("Step budget of {limit} exceeded in run '{run_id}'")]
    StepBudgetExceeded {
        run_id: String,
        limit: usize,
        state: Box<GraphState>,
    },

    /// The frontier emptied before any finish point completed
    #[error("Run '{run_id}' stalled with no finish point reached (waiting: {waiting:?})")]
    Stalled {
        run_id: String,
        waiting: Vec<String>,
        state: Box<GraphState>,
    },

    #[error("Run '{run_id}' was cancelled")]
    Cancelled {
        run_id: String,
        state: Box<GraphState>,
    },

    #[error("Run '{0}' already has an execution in flight")]
    RunInProgress(String),

    #[error("Episode '{0}' is already closed")]
    EpisodeClosed(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl KernelError {
    /// Final state carried by execution-time errors, if any
    pub fn state(&self) -> Option<&GraphState> {
        match self {
            Self::GraphExecution(f) | Self::Timeout(f) => Some(&f.state),
            Self::StepBudgetExceeded { state, .. }
            | Self::Stalled { state, .. }
            | Self::Cancelled { state, .. } => Some(state),
            _ => None,
        }
    }

    /// Failing node for execution-time errors
    pub fn failed_node(&self) -> Option<&str> {
        match self {
            Self::GraphExecution(f) | Self::Timeout(f) => Some(&f.node_id),
            _ => None,
        }
    }

    pub(crate) fn execution(failure: ExecutionFailure) -> Self {
        if matches!(failure.cause, FailureCause::Timeout(_)) {
            Self::Timeout(Box::new(failure))
        } else {
            Self::GraphExecution(Box::new(failure))
        }
    }

    pub(crate) fn lock<E: std::fmt::Display>(e: E) -> Self {
        Self::Lock(e.to_string())
    }
}

impl From<rusqlite::Error> for KernelError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(anyhow::Error::new(e))
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(anyhow::Error::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_cause_maps_to_timeout_variant() {
        let failure = ExecutionFailure {
            node_id: "slow".to_string(),
            phase: "building".to_string(),
            retry_count: 1,
            cause: FailureCause::Timeout(Duration::from_millis(10)),
            state: GraphState::new("run-1"),
        };
        let err = KernelError::execution(failure);
        assert!(matches!(err, KernelError::Timeout(_)));
        assert_eq!(err.failed_node(), Some("slow"));
        assert!(err.to_string().contains("building"));
    }

    #[test]
    fn test_handler_cause_maps_to_execution_variant() {
        let failure = ExecutionFailure {
            node_id: "a".to_string(),
            phase: "init".to_string(),
            retry_count: 0,
            cause: FailureCause::Handler("boom".to_string()),
            state: GraphState::new("run-1"),
        };
        let err = KernelError::execution(failure);
        assert!(matches!(err, KernelError::GraphExecution(_)));
        assert!(err.to_string().contains("boom"));
        assert_eq!(err.state().map(|s| s.run_id.as_str()), Some("run-1"));
    }
}
