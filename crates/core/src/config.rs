//! # Kernel Configuration
//!
//! Settings for every kernel service, loaded from `<runtime>/config.json`
//! when present. Missing sections and fields fall back to defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::storage::db::DB_FILE;
use crate::storage::io::get_runtime_path;

/// Config file name inside the runtime directory
pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Concurrent node handlers per run
    pub max_parallel: usize,
    /// Loop guard on processed node outcomes
    pub max_total_steps: Option<usize>,
    /// Default per-node timeout
    pub node_timeout_secs: Option<f64>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            max_total_steps: Some(1000),
            node_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub short_term_capacity: usize,
    /// Default TTL for short-term entries
    pub short_term_ttl_secs: Option<f64>,
    /// Write long-term and semantic entries through to the database
    pub persist: bool,
    /// Background purge of expired entries; `None` disables the sweeper
    pub sweep_interval_secs: Option<u64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_capacity: 100,
            short_term_ttl_secs: Some(3600.0),
            persist: true,
            sweep_interval_secs: Some(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub max_history: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { max_history: 1000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub max_history: usize,
    pub default_timeout_secs: Option<f64>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_history: 1000,
            default_timeout_secs: Some(300.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    pub max_finished_spans: usize,
    /// Log each finished span at debug level
    pub log_spans: bool,
    /// Append finished spans as JSON lines to this file
    pub jsonl_path: Option<PathBuf>,
    /// Fraction of traces exported, `0.0..=1.0`
    pub sample_rate: f64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            max_finished_spans: 10_000,
            log_spans: false,
            jsonl_path: None,
            sample_rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Overrides `WAYPOINT_RUNTIME_PATH` / `./.waypoint`
    pub runtime_dir: Option<PathBuf>,
    /// Database file; defaults to `<runtime>/waypoint.db`
    pub db_path: Option<PathBuf>,
    pub graph: GraphConfig,
    pub memory: MemoryConfig,
    pub events: EventsConfig,
    pub tools: ToolsConfig,
    pub tracing: TracingConfig,
}

impl KernelConfig {
    /// Load `<runtime>/config.json`, or defaults when it does not exist
    pub fn load() -> Result<Self> {
        let path = get_runtime_path().join(CONFIG_FILE);
        if !path.exists() {
            tracing::debug!(path = ?path, "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config in {:?}", path))?;
        tracing::info!(path = ?path, "Config loaded");
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write config: {:?}", path))
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir.clone().unwrap_or_else(get_runtime_path)
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.runtime_dir().join(DB_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = std::env::temp_dir().join(format!("waypoint-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join(CONFIG_FILE);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(&path, r#"{ "graph": { "max_parallel": 8 }, "memory": { "persist": false } }"#)
            .unwrap();

        let config = KernelConfig::load_from(&path).unwrap();
        assert_eq!(config.graph.max_parallel, 8);
        assert_eq!(config.graph.max_total_steps, Some(1000));
        assert!(!config.memory.persist);
        assert_eq!(config.memory.short_term_capacity, 100);
        assert_eq!(config.events.max_history, 1000);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join(format!("waypoint-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join(CONFIG_FILE);
        let mut config = KernelConfig::default();
        config.runtime_dir = Some(dir.clone());
        config.tracing.log_spans = true;
        config.save_to(&path).unwrap();

        let back = KernelConfig::load_from(&path).unwrap();
        assert!(back.tracing.log_spans);
        assert_eq!(back.db_path(), dir.join(DB_FILE));

        let _ = std::fs::remove_dir_all(dir);
    }
}
