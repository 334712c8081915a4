//! # Waypoint Core
//!
//! The orchestration kernel behind Waypoint's migration pipeline: a state
//! graph executor with bounded parallelism and checkpoint/resume, tool and
//! hook registries, an event bus, a span tracer and four-tier memory.
//!
//! ## Architecture
//!
//! - `graph/` - StateGraph builder, compiled executor, checkpoints
//! - `pipeline/` - Migration phase machine built on the graph
//! - `tools/` - Tool trait and registry
//! - `hooks/` - Lifecycle interceptors
//! - `events/` - Typed pub/sub bus
//! - `tracer/` - Hierarchical spans and exporters
//! - `memory/` - Short-term, long-term, semantic and episodic memory
//! - `storage/` - SQLite database and runtime directory helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use waypoint_core::{Kernel, KernelConfig, PipelineConfig, PipelineController};
//!
//! let kernel = Arc::new(Kernel::new(KernelConfig::load()?)?);
//! // register the analyze/build/execute/validate/diagnose tools ...
//! let controller = PipelineController::new(kernel, PipelineConfig::new("legacy", "out"))?;
//! let summary = controller.run().await?;
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod hooks;
pub mod kernel;
pub mod memory;
pub mod pipeline;
pub mod storage;
pub mod tools;
pub mod tracer;

pub use config::KernelConfig;
pub use error::{KernelError, KernelResult};
pub use graph::{CompiledGraph, GraphState, StateGraph, StateUpdate, StateView};
pub use kernel::Kernel;
pub use pipeline::{Phase, PipelineConfig, PipelineController};
