//! # Checkpoint Storage
//!
//! SQLite-backed [`CheckpointStore`]. Each row carries the indexed columns
//! plus the whole checkpoint as JSON, so records written by older versions
//! still load through serde defaults.

use std::sync::{Arc, Mutex};

use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};

use super::db::KernelDb;
use crate::error::{KernelError, KernelResult};
use crate::graph::{Checkpoint, CheckpointStore};

pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointStore {
    pub fn new(db: &KernelDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Drop every checkpoint of a run
    pub fn delete_run(&self, run_id: &str) -> KernelResult<usize> {
        let conn = self.conn.lock().map_err(KernelError::lock)?;
        let removed = conn.execute("DELETE FROM checkpoints WHERE run_id = ?1", params![run_id])?;
        tracing::info!(run_id = %run_id, removed, "Checkpoints deleted");
        Ok(removed)
    }

    fn decode(data: String) -> KernelResult<Checkpoint> {
        serde_json::from_str(&data)
            .context("Corrupt checkpoint record")
            .map_err(KernelError::from)
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> KernelResult<()> {
        let conn = self.conn.lock().map_err(KernelError::lock)?;
        let data = serde_json::to_string(checkpoint)?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO checkpoints (id, run_id, step, phase, status, timestamp, data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                checkpoint.id,
                checkpoint.run_id,
                checkpoint.step as i64,
                checkpoint.phase,
                checkpoint.status.as_str(),
                checkpoint.timestamp.to_rfc3339(),
                data,
            ],
        )
        .context("Failed to save checkpoint")?;

        tracing::debug!(checkpoint_id = %checkpoint.id, status = checkpoint.status.as_str(), "Checkpoint saved");
        Ok(())
    }

    fn load(&self, id: &str) -> KernelResult<Checkpoint> {
        let conn = self.conn.lock().map_err(KernelError::lock)?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM checkpoints WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match data {
            Some(data) => Self::decode(data),
            None => Err(KernelError::NotFound(format!("checkpoint '{}'", id))),
        }
    }

    fn latest(&self, run_id: &str) -> KernelResult<Option<Checkpoint>> {
        let conn = self.conn.lock().map_err(KernelError::lock)?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM checkpoints WHERE run_id = ?1 ORDER BY step DESC LIMIT 1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        data.map(Self::decode).transpose()
    }

    fn list(&self, run_id: &str) -> KernelResult<Vec<Checkpoint>> {
        let conn = self.conn.lock().map_err(KernelError::lock)?;
        let mut stmt = conn.prepare("SELECT data FROM checkpoints WHERE run_id = ?1 ORDER BY step ASC")?;
        let rows = stmt
            .query_map(params![run_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(Self::decode).collect()
    }

    fn runs(&self) -> KernelResult<Vec<String>> {
        let conn = self.conn.lock().map_err(KernelError::lock)?;
        let mut stmt = conn.prepare("SELECT DISTINCT run_id FROM checkpoints ORDER BY run_id")?;
        let runs = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CheckpointStatus, GraphState};
    use std::collections::BTreeMap;

    fn capture(state: &GraphState, status: CheckpointStatus) -> Checkpoint {
        Checkpoint::capture(state, vec!["next".to_string()], status, false, BTreeMap::new())
    }

    #[test]
    fn test_save_and_query() {
        let db = KernelDb::open_in_memory().unwrap();
        let store = SqliteCheckpointStore::new(&db);

        let mut state = GraphState::new("run-1").with("answer", serde_json::json!(42));
        for step in 1..=3 {
            state.step = step;
            store.save(&capture(&state, CheckpointStatus::Running)).unwrap();
        }
        // Terminal record replaces the last step
        store.save(&capture(&state, CheckpointStatus::Completed)).unwrap();

        let latest = store.latest("run-1").unwrap().unwrap();
        assert_eq!(latest.step, 3);
        assert_eq!(latest.status, CheckpointStatus::Completed);
        assert_eq!(latest.state.get("answer"), Some(&serde_json::json!(42)));
        assert_eq!(latest.frontier, vec!["next".to_string()]);

        let all = store.list("run-1").unwrap();
        assert_eq!(all.iter().map(|c| c.step).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(store.load("run-1:2").unwrap().step, 2);
        assert!(matches!(store.load("run-1:9"), Err(KernelError::NotFound(_))));
        assert_eq!(store.runs().unwrap(), vec!["run-1".to_string()]);

        assert_eq!(store.delete_run("run-1").unwrap(), 3);
        assert!(store.latest("run-1").unwrap().is_none());
    }
}
