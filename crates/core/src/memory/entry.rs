//! # Memory Entries

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Retention class of an entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    ShortTerm,
    LongTerm,
    Semantic,
    Episodic,
}

impl MemoryTier {
    pub const ALL: [MemoryTier; 4] = [
        MemoryTier::ShortTerm,
        MemoryTier::LongTerm,
        MemoryTier::Semantic,
        MemoryTier::Episodic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShortTerm => "short_term",
            Self::LongTerm => "long_term",
            Self::Semantic => "semantic",
            Self::Episodic => "episodic",
        }
    }

}

impl std::str::FromStr for MemoryTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "short_term" => Ok(Self::ShortTerm),
            "long_term" => Ok(Self::LongTerm),
            "semantic" => Ok(Self::Semantic),
            "episodic" => Ok(Self::Episodic),
            _ => Err(format!("Unknown memory tier: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPriority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

/// A stored memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub content: serde_json::Value,
    pub tier: MemoryTier,
    #[serde(default)]
    pub priority: MemoryPriority,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: Option<f64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_accessed: DateTime<Utc>,
    #[serde(default)]
    pub access_count: u64,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl MemoryEntry {
    pub fn new(content: serde_json::Value, tier: MemoryTier, options: StoreOptions) -> Self {
        let now = Utc::now();
        let expires_at = options.ttl.and_then(|ttl| {
            chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
        });
        Self {
            id: options
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            content,
            tier,
            priority: options.priority.unwrap_or_default(),
            tags: options.tags,
            created_at: now,
            ttl_secs: options.ttl.map(|t| t.as_secs_f64()),
            expires_at,
            last_accessed: now,
            access_count: 0,
            metadata: options.metadata,
        }
    }

    /// An entry is expired once `now` reaches its expiry instant
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub(crate) fn touch(&mut self) {
        self.last_accessed = Utc::now();
        self.access_count += 1;
    }

    /// Drop any expiry (used when promoting into a durable tier)
    pub(crate) fn clear_ttl(&mut self) {
        self.ttl_secs = None;
        self.expires_at = None;
    }

    /// Content rendered as plain text
    pub fn text(&self) -> String {
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Case-insensitive match against content, tags and id. Empty query matches.
    pub fn matches(&self, query: &str) -> bool {
        if query.is_empty() {
            return true;
        }
        let needle = query.to_lowercase();
        self.text().to_lowercase().contains(&needle)
            || self.tags.iter().any(|t| t.to_lowercase().contains(&needle))
            || self.id.to_lowercase().contains(&needle)
    }
}

/// Optional parameters for `MemoryManager::store`
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub id: Option<String>,
    pub ttl: Option<Duration>,
    pub priority: Option<MemoryPriority>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn ttl_secs(self, secs: f64) -> Self {
        self.ttl(Duration::from_secs_f64(secs.max(0.0)))
    }

    pub fn priority(mut self, priority: MemoryPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_ttl_is_expired_immediately() {
        let entry = MemoryEntry::new(
            serde_json::json!("scratch"),
            MemoryTier::ShortTerm,
            StoreOptions::new().ttl_secs(0.0),
        );
        assert!(entry.is_expired());
    }

    #[test]
    fn test_no_ttl_never_expires() {
        let entry = MemoryEntry::new(
            serde_json::json!({ "table": "orders" }),
            MemoryTier::LongTerm,
            StoreOptions::new().tags(["schema"]),
        );
        assert!(!entry.is_expired_at(Utc::now() + chrono::Duration::days(365)));
        assert!(entry.matches("ORDERS"));
        assert!(entry.matches("schem"));
        assert!(!entry.matches("invoices"));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(MemoryPriority::Critical > MemoryPriority::High);
        assert!(MemoryPriority::Low < MemoryPriority::Normal);
        assert_eq!("episodic".parse::<MemoryTier>(), Ok(MemoryTier::Episodic));
        assert!("archive".parse::<MemoryTier>().is_err());
    }
}
