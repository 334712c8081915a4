//! # Persisted Memories
//!
//! Write-through storage for durable memory tiers, sharing the
//! `KernelDb` connection.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};

use super::db::KernelDb;
use crate::memory::{MemoryEntry, MemoryTier};

pub struct MemoryRepository {
    conn: Arc<Mutex<Connection>>,
}

impl MemoryRepository {
    pub fn new(db: &KernelDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Insert or replace an entry
    pub fn save(&self, entry: &MemoryEntry) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let data = serde_json::to_string(entry)?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO memories (id, tier, priority, created_at, data)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                entry.id,
                entry.tier.as_str(),
                entry.priority as i32,
                entry.created_at.to_rfc3339(),
                data,
            ],
        )
        .context("Failed to save memory")?;

        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let removed = conn
            .execute("DELETE FROM memories WHERE id = ?1", params![id])
            .context("Failed to delete memory")?;
        Ok(removed > 0)
    }

    /// All persisted entries of one tier, oldest first
    pub fn load_tier(&self, tier: MemoryTier) -> Result<Vec<MemoryEntry>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare(
            "SELECT data FROM memories WHERE tier = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![tier.as_str()], |row| row.get::<_, String>(0))?;

        let mut entries = Vec::new();
        for row in rows {
            let data = row?;
            match serde_json::from_str::<MemoryEntry>(&data) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable memory row"),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::StoreOptions;

    #[test]
    fn test_save_load_delete() {
        let db = KernelDb::open_in_memory().unwrap();
        let repo = MemoryRepository::new(&db);

        let entry = MemoryEntry::new(
            serde_json::json!("orders maps to fact_orders"),
            MemoryTier::LongTerm,
            StoreOptions::new().id("m1").tags(["mapping"]),
        );
        repo.save(&entry).unwrap();
        repo.save(&entry).unwrap();

        let loaded = repo.load_tier(MemoryTier::LongTerm).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].tags, vec!["mapping".to_string()]);
        assert!(repo.load_tier(MemoryTier::Semantic).unwrap().is_empty());

        assert!(repo.delete("m1").unwrap());
        assert!(!repo.delete("m1").unwrap());
    }
}
