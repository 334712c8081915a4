//! # Run Summaries
//!
//! Final record of a pipeline run, written once at a terminal phase.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::db::KernelDb;
use super::io::write_json;
use crate::graph::{GraphState, NodeError};

/// One phase entry of a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseRecord {
    pub phase: String,
    pub retry_count: u32,
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub final_phase: String,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    #[serde(default)]
    pub phase_history: Vec<PhaseRecord>,
    #[serde(default)]
    pub errors: Vec<NodeError>,
    pub state: GraphState,
}

impl RunSummary {
    pub fn new(state: &GraphState, started_at: DateTime<Utc>, phase_history: Vec<PhaseRecord>) -> Self {
        let finished_at = Utc::now();
        Self {
            run_id: state.run_id.clone(),
            final_phase: state.phase.clone(),
            retry_count: state.retry_count,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds(),
            phase_history,
            errors: state.errors.clone(),
            state: state.clone(),
        }
    }

    /// `run_summary_<run_id>.json`
    pub fn file_name(run_id: &str) -> String {
        format!("run_summary_{}.json", run_id)
    }

    /// Write the summary as pretty JSON into `dir`
    pub async fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(Self::file_name(&self.run_id));
        write_json(&path, self).await?;
        Ok(path)
    }
}

/// Run summaries kept in the `run_summaries` table
pub struct RunSummaryStore {
    conn: Arc<Mutex<Connection>>,
}

impl RunSummaryStore {
    pub fn new(db: &KernelDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    pub fn save(&self, summary: &RunSummary) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let data = serde_json::to_string(summary)?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO run_summaries (run_id, final_phase, retry_count, started_at, finished_at, data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                summary.run_id,
                summary.final_phase,
                summary.retry_count,
                summary.started_at.to_rfc3339(),
                summary.finished_at.to_rfc3339(),
                data,
            ],
        )
        .context("Failed to save run summary")?;

        tracing::info!(run_id = %summary.run_id, phase = %summary.final_phase, "Run summary saved");
        Ok(())
    }

    pub fn load(&self, run_id: &str) -> Result<Option<RunSummary>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM run_summaries WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        match data {
            Some(data) => Ok(Some(
                serde_json::from_str(&data).context("Corrupt run summary")?,
            )),
            None => Ok(None),
        }
    }

    /// Most recently finished first
    pub fn list(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt =
            conn.prepare("SELECT data FROM run_summaries ORDER BY finished_at DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list run summaries")?;

        rows.iter()
            .map(|data| serde_json::from_str(data).context("Corrupt run summary"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(run_id: &str, phase: &str) -> RunSummary {
        let mut state = GraphState::new(run_id);
        state.phase = phase.to_string();
        state.retry_count = 2;
        RunSummary::new(
            &state,
            Utc::now() - chrono::Duration::seconds(3),
            vec![PhaseRecord {
                phase: "analyzing".to_string(),
                retry_count: 0,
                entered_at: Utc::now(),
            }],
        )
    }

    #[test]
    fn test_save_load_list() {
        let db = KernelDb::open_in_memory().unwrap();
        let store = RunSummaryStore::new(&db);

        store.save(&summary("r1", "complete")).unwrap();
        store.save(&summary("r2", "failed")).unwrap();

        let loaded = store.load("r1").unwrap().unwrap();
        assert_eq!(loaded.final_phase, "complete");
        assert_eq!(loaded.retry_count, 2);
        assert!(loaded.duration_ms >= 3000);
        assert!(store.load("missing").unwrap().is_none());

        let recent = store.list(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].run_id, "r2");
        assert_eq!(store.list(1).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_write_to_directory() {
        let dir = std::env::temp_dir().join(format!("waypoint-summary-{}", uuid::Uuid::new_v4()));
        let path = summary("r9", "complete").write_to(&dir).await.unwrap();

        assert!(path.ends_with("run_summary_r9.json"));
        let back: RunSummary = crate::storage::io::read_json(&path).await.unwrap();
        assert_eq!(back.run_id, "r9");

        let _ = std::fs::remove_dir_all(dir);
    }
}
