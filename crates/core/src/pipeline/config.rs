use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Launcher inputs for one pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Legacy project to migrate
    pub input_path: PathBuf,
    /// Where artifacts, reports and run summaries are written
    pub output_dir: PathBuf,
    /// Skip approval prompts in the execute tool
    pub auto_approve: bool,
    /// Upper bound on diagnosis retries
    pub max_iterations: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_path: PathBuf::from("."),
            output_dir: PathBuf::from("output"),
            auto_approve: false,
            max_iterations: 3,
        }
    }
}

impl PipelineConfig {
    pub fn new(input_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = auto_approve;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }
}
