//! # Tier Store
//!
//! Entry map backing a single memory tier. Optional capacity and default
//! TTL; when full, expired entries are evicted first, then the least
//! recently accessed one.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::entry::MemoryEntry;

/// Outcome of a lookup by id
pub(crate) enum Lookup {
    Live(MemoryEntry),
    /// Found past its expiry and dropped
    Expired,
    Missing,
}

pub(crate) struct TierStore {
    entries: HashMap<String, MemoryEntry>,
    /// Logical access clock; larger is more recent
    recency: HashMap<String, u64>,
    clock: u64,
    capacity: Option<usize>,
    default_ttl: Option<Duration>,
}

impl TierStore {
    pub(crate) fn new(capacity: Option<usize>, default_ttl: Option<Duration>) -> Self {
        Self {
            entries: HashMap::new(),
            recency: HashMap::new(),
            clock: 0,
            capacity,
            default_ttl,
        }
    }

    pub(crate) fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl
    }

    fn tick(&mut self, id: &str) {
        self.clock += 1;
        self.recency.insert(id.to_string(), self.clock);
    }

    /// Insert or replace an entry. Returns ids evicted to make room.
    pub(crate) fn insert(&mut self, entry: MemoryEntry) -> Vec<String> {
        let mut evicted = Vec::new();
        if let Some(capacity) = self.capacity {
            if !self.entries.contains_key(&entry.id) && self.entries.len() >= capacity {
                evicted.extend(self.purge_expired(Utc::now()));
                while self.entries.len() >= capacity.max(1) {
                    match self.least_recent() {
                        Some(id) => {
                            self.remove(&id);
                            evicted.push(id);
                        }
                        None => break,
                    }
                }
            }
        }
        let id = entry.id.clone();
        self.entries.insert(id.clone(), entry);
        self.tick(&id);
        evicted
    }

    fn least_recent(&self) -> Option<String> {
        self.entries
            .keys()
            .min_by_key(|id| self.recency.get(*id).copied().unwrap_or(0))
            .cloned()
    }

    /// Live entry by id, touched. Expired entries are dropped on sight.
    pub(crate) fn get(&mut self, id: &str, now: DateTime<Utc>) -> Lookup {
        let Some(entry) = self.entries.get_mut(id) else {
            return Lookup::Missing;
        };
        if entry.is_expired_at(now) {
            self.remove(id);
            return Lookup::Expired;
        }
        entry.touch();
        let snapshot = entry.clone();
        self.tick(id);
        Lookup::Live(snapshot)
    }

    /// Live entry by id without touching it
    pub(crate) fn peek(&self, id: &str, now: DateTime<Utc>) -> Option<&MemoryEntry> {
        self.entries.get(id).filter(|e| !e.is_expired_at(now))
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<MemoryEntry> {
        self.recency.remove(id);
        self.entries.remove(id)
    }

    pub(crate) fn live(&self, now: DateTime<Utc>) -> impl Iterator<Item = &MemoryEntry> {
        self.entries.values().filter(move |e| !e.is_expired_at(now))
    }

    pub(crate) fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.is_expired_at(now))
            .map(|e| e.id.clone())
            .collect();
        for id in &expired {
            self.remove(id);
        }
        expired
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn expired_count(&self, now: DateTime<Utc>) -> usize {
        self.entries.values().filter(|e| e.is_expired_at(now)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::entry::{MemoryTier, StoreOptions};

    fn entry(id: &str, ttl: Option<f64>) -> MemoryEntry {
        let mut opts = StoreOptions::new().id(id);
        if let Some(secs) = ttl {
            opts = opts.ttl_secs(secs);
        }
        MemoryEntry::new(serde_json::json!(id), MemoryTier::ShortTerm, opts)
    }

    #[test]
    fn test_lru_eviction() {
        let mut store = TierStore::new(Some(2), None);
        store.insert(entry("a", None));
        store.insert(entry("b", None));
        assert!(matches!(store.get("a", Utc::now()), Lookup::Live(_)));

        let evicted = store.insert(entry("c", None));
        assert_eq!(evicted, vec!["b".to_string()]);
        assert!(store.peek("a", Utc::now()).is_some());
        assert!(store.peek("c", Utc::now()).is_some());
    }

    #[test]
    fn test_expired_evicted_before_lru() {
        let mut store = TierStore::new(Some(2), None);
        store.insert(entry("old", None));
        store.insert(entry("stale", Some(0.0)));

        let evicted = store.insert(entry("new", None));
        assert_eq!(evicted, vec!["stale".to_string()]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_get_reports_expiry_once() {
        let mut store = TierStore::new(None, None);
        store.insert(entry("gone", Some(0.0)));
        assert!(matches!(store.get("gone", Utc::now()), Lookup::Expired));
        assert!(matches!(store.get("gone", Utc::now()), Lookup::Missing));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_replacing_existing_id_does_not_evict() {
        let mut store = TierStore::new(Some(1), None);
        store.insert(entry("a", None));
        let evicted = store.insert(entry("a", None));
        assert!(evicted.is_empty());
        assert_eq!(store.len(), 1);
    }
}
