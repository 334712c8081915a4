//! # Semantic Facts
//!
//! Facts live in the semantic tier as ordinary entries keyed by fact id;
//! confidence and source travel in the entry metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entry::MemoryEntry;

pub(crate) const CONFIDENCE_KEY: &str = "confidence";
pub(crate) const SOURCE_KEY: &str = "source";

/// Typed view of a semantic-tier entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub content: serde_json::Value,
    pub confidence: f64,
    pub source: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&MemoryEntry> for Fact {
    fn from(entry: &MemoryEntry) -> Self {
        Self {
            id: entry.id.clone(),
            content: entry.content.clone(),
            confidence: entry
                .metadata
                .get(CONFIDENCE_KEY)
                .and_then(|v| v.as_f64())
                .unwrap_or(1.0),
            source: entry
                .metadata
                .get(SOURCE_KEY)
                .and_then(|v| v.as_str())
                .map(str::to_string),
            updated_at: entry.created_at,
        }
    }
}
