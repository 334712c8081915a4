//! # Tools
//!
//! Registry of named async capabilities invoked by graph nodes.

pub mod registry;
pub mod tool;

pub use registry::{ToolAnalytics, ToolExecution, ToolRegistry};
pub use tool::{FnTool, Tool, ToolCategory, ToolResult, ToolSpec};
