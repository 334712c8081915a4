//! # Migration Pipeline
//!
//! Phase machine (`init → analyzing → building → executing → validating →
//! complete | failed`, with a bounded `diagnosing → building` retry loop)
//! running on the kernel's state graph.

pub mod config;
pub mod controller;
pub mod phase;

pub use config::PipelineConfig;
pub use controller::{episode_name, PipelineController, REQUIRED_TOOLS};
pub use phase::Phase;
