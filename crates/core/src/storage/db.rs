//! # Kernel Database
//!
//! Single SQLite database for checkpoints, run summaries and persisted
//! long-term memories. Lives at `.waypoint/waypoint.db` by default.
//!
//! Schema changes are appended to [`MIGRATIONS`]; each one runs in its own
//! transaction and is recorded in `schema_migrations`.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Database file name inside the runtime directory
pub const DB_FILE: &str = "waypoint.db";

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "run state",
        // One checkpoint row per node boundary; `data` holds the full record
        sql: r#"
            CREATE TABLE checkpoints (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                step INTEGER NOT NULL,
                phase TEXT NOT NULL,
                status TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX idx_checkpoints_run ON checkpoints(run_id, step);

            CREATE TABLE run_summaries (
                run_id TEXT PRIMARY KEY,
                final_phase TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX idx_summaries_finished ON run_summaries(finished_at);
        "#,
    },
    Migration {
        version: 2,
        name: "persisted memories",
        sql: r#"
            CREATE TABLE memories (
                id TEXT PRIMARY KEY,
                tier TEXT NOT NULL,
                priority INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX idx_memories_tier ON memories(tier);
        "#,
    },
];

/// Bring `conn` up to the newest schema. Returns the resulting version.
fn migrate(conn: &mut Connection) -> Result<i64> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )?;
    let mut version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    let current = version;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)
            .with_context(|| format!("Migration {} ({}) failed", migration.version, migration.name))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![migration.version, migration.name, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        version = migration.version;
        tracing::info!(version, name = migration.name, "Applied schema migration");
    }
    Ok(version)
}

/// Shared handle to the kernel database
pub struct KernelDb {
    conn: Arc<Mutex<Connection>>,
}

impl KernelDb {
    /// Open (creating if needed) the database file at `path`
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create database directory: {:?}", dir))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open waypoint database at {:?}", path))?;
        Self::from_connection(conn)
    }

    /// Private in-memory database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        let version = migrate(&mut conn)?;
        tracing::debug!(version, "Kernel database ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Get a shared connection for use by other modules
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    pub fn schema_version(&self) -> Result<i64> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        let version = conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))?;
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_tables() {
        let db = KernelDb::open_in_memory().unwrap();
        let conn = db.connection();
        let conn = conn.lock().unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for table in ["checkpoints", "memories", "run_summaries", "schema_migrations"] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[test]
    fn test_reopen_keeps_schema_version() {
        let dir = std::env::temp_dir().join(format!("waypoint-db-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("version.db");

        drop(KernelDb::open_at(&path).unwrap());
        let db = KernelDb::open_at(&path).unwrap();
        assert_eq!(db.schema_version().unwrap(), 2);

        let conn = db.connection();
        let names: Vec<String> = conn
            .lock()
            .unwrap()
            .prepare("SELECT name FROM schema_migrations ORDER BY version")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        assert_eq!(names, ["run state", "persisted memories"]);

        drop(db);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_older_database_is_upgraded() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_migrations (version INTEGER PRIMARY KEY, name TEXT NOT NULL, applied_at TEXT NOT NULL)",
        )
        .unwrap();
        conn.execute_batch(MIGRATIONS[0].sql).unwrap();
        conn.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (1, 'run state', 'then')",
            [],
        )
        .unwrap();

        assert_eq!(migrate(&mut conn).unwrap(), 2);
        let memories: i64 = conn
            .query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))
            .unwrap();
        assert_eq!(memories, 0);
        // Nothing left to apply
        assert_eq!(migrate(&mut conn).unwrap(), 2);
    }
}
