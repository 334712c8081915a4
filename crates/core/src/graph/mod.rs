//! # State Graph
//!
//! Declarative DAG of nodes over a shared key/value state, executed with
//! bounded parallelism and checkpointed after every node.

pub mod builder;
pub mod checkpoint;
pub mod compiled;
pub mod node;
pub mod state;

pub use builder::{when, Predicate, StateGraph};
pub use checkpoint::{
    Checkpoint, CheckpointStatus, CheckpointStore, InMemoryCheckpointStore, CHECKPOINT_VERSION,
};
pub use compiled::{CancelHandle, CompiledGraph, GraphOptions, GraphServices, RunOutcome, RunRegistry};
pub use node::{NodeBuilder, NodeHandler, ToolNode};
pub use state::{GraphState, NodeError, StateUpdate, StateView, INITIAL_PHASE};
