//! # IO Utilities
//!
//! Runtime directory resolution and JSON file helpers.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Environment variable overriding the runtime directory
pub const RUNTIME_PATH_ENV: &str = "WAYPOINT_RUNTIME_PATH";

/// Default runtime directory, relative to the working directory
pub const RUNTIME_DIR: &str = ".waypoint";

/// `$WAYPOINT_RUNTIME_PATH` when set and non-empty, else `./.waypoint`
pub fn get_runtime_path() -> PathBuf {
    resolve_runtime_path(std::env::var_os(RUNTIME_PATH_ENV))
}

fn resolve_runtime_path(overridden: Option<OsString>) -> PathBuf {
    if let Some(path) = overridden.filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(RUNTIME_DIR),
        Err(_) => PathBuf::from(RUNTIME_DIR),
    }
}

/// Write a value as pretty JSON, creating parent directories
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_string_pretty(value)?;
    fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write file: {:?}", path))
}

/// Read a JSON file
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file: {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_path_resolution() {
        assert_eq!(
            resolve_runtime_path(Some("/srv/waypoint".into())),
            PathBuf::from("/srv/waypoint")
        );
        assert!(resolve_runtime_path(Some(OsString::new())).ends_with(RUNTIME_DIR));
        assert!(resolve_runtime_path(None).ends_with(RUNTIME_DIR));
    }

    #[tokio::test]
    async fn test_json_round_trip_creates_dirs() {
        let dir = std::env::temp_dir().join(format!("waypoint-io-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("value.json");

        write_json(&path, &serde_json::json!({ "phase": "complete" }))
            .await
            .unwrap();
        let value: serde_json::Value = read_json(&path).await.unwrap();
        assert_eq!(value["phase"], "complete");

        let _ = fs::remove_dir_all(dir).await;
    }
}
