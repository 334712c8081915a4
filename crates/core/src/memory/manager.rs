//! # Memory Manager
//!
//! Facade over the four tiers. Each tier has its own lock, so callers on
//! different tiers never contend. Expiry is enforced on every read; the
//! optional sweeper only reclaims space.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::config::MemoryConfig;
use crate::error::{KernelError, KernelResult};
use crate::events::{EventBus, EventKind};
use crate::storage::MemoryRepository;

use super::entry::{MemoryEntry, MemoryPriority, MemoryTier, StoreOptions};
use super::episodic::Episode;
use super::semantic::{Fact, CONFIDENCE_KEY, SOURCE_KEY};
use super::store::{Lookup, TierStore};

/// Per-tier counts
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStats {
    pub short_term: usize,
    pub long_term: usize,
    pub semantic: usize,
    pub episodic: usize,
    pub episodes: usize,
    pub open_episodes: usize,
    /// Entries past expiry but not yet purged
    pub expired_pending: usize,
}

/// Outcome of `consolidate`
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidationReport {
    pub promoted: usize,
    pub purged: usize,
}

pub struct MemoryManager {
    short_term: Mutex<TierStore>,
    long_term: Mutex<TierStore>,
    semantic: Mutex<TierStore>,
    episodic: Mutex<TierStore>,
    episodes: Mutex<HashMap<String, Episode>>,
    /// Held while an id may change tiers; an id lives in one tier at a time
    placement: Mutex<()>,
    repository: Option<MemoryRepository>,
    events: Option<Arc<EventBus>>,
    config: MemoryConfig,
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl MemoryManager {
    pub fn new(config: MemoryConfig) -> Self {
        let short_ttl = config
            .short_term_ttl_secs
            .map(|s| Duration::from_secs_f64(s.max(0.0)));
        Self {
            short_term: Mutex::new(TierStore::new(Some(config.short_term_capacity), short_ttl)),
            long_term: Mutex::new(TierStore::new(None, None)),
            semantic: Mutex::new(TierStore::new(None, None)),
            episodic: Mutex::new(TierStore::new(None, None)),
            episodes: Mutex::new(HashMap::new()),
            placement: Mutex::new(()),
            repository: None,
            events: None,
            config,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Persist long-term and semantic entries, loading what is already stored
    pub fn with_repository(mut self, repository: MemoryRepository) -> KernelResult<Self> {
        for tier in [MemoryTier::LongTerm, MemoryTier::Semantic] {
            let entries = repository.load_tier(tier)?;
            let mut store = self.tier(tier)?;
            for entry in entries {
                store.insert(entry);
            }
        }
        self.repository = Some(repository);
        Ok(self)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    fn tier(&self, tier: MemoryTier) -> KernelResult<MutexGuard<'_, TierStore>> {
        let lock = match tier {
            MemoryTier::ShortTerm => &self.short_term,
            MemoryTier::LongTerm => &self.long_term,
            MemoryTier::Semantic => &self.semantic,
            MemoryTier::Episodic => &self.episodic,
        };
        lock.lock().map_err(KernelError::lock)
    }

    fn persists(&self, tier: MemoryTier) -> Option<&MemoryRepository> {
        match tier {
            MemoryTier::LongTerm | MemoryTier::Semantic if self.config.persist => {
                self.repository.as_ref()
            }
            _ => None,
        }
    }

    fn emit(&self, kind: EventKind, data: serde_json::Value) {
        if let Some(events) = &self.events {
            events.emit(kind, "memory", data);
        }
    }

    /// Store content in a tier and return its id. An entry with the same id
    /// in another tier is replaced.
    pub fn store(
        &self,
        content: serde_json::Value,
        tier: MemoryTier,
        mut options: StoreOptions,
    ) -> KernelResult<String> {
        if options.ttl.is_none() {
            options.ttl = self.tier(tier)?.default_ttl();
        }
        let entry = MemoryEntry::new(content, tier, options);
        let id = entry.id.clone();

        let evicted = {
            let _placement = self.placement.lock().map_err(KernelError::lock)?;
            self.take_from_other_tiers(&id, tier)?;
            if let Some(repo) = self.persists(tier) {
                repo.save(&entry)?;
            }
            self.tier(tier)?.insert(entry)
        };
        self.emit(
            EventKind::MemoryStored,
            json!({ "id": id, "tier": tier.as_str() }),
        );
        if !evicted.is_empty() {
            tracing::debug!(tier = tier.as_str(), count = evicted.len(), "Evicted memory entries");
        }
        Ok(id)
    }

    /// Drop `id` from every tier except `keep`
    fn take_from_other_tiers(&self, id: &str, keep: MemoryTier) -> KernelResult<()> {
        for tier in MemoryTier::ALL.into_iter().filter(|t| *t != keep) {
            if self.tier(tier)?.remove(id).is_none() {
                continue;
            }
            if let Some(repo) = self.persists(tier) {
                repo.delete(id)?;
            }
            tracing::debug!(id, from = tier.as_str(), to = keep.as_str(), "Memory id moved to another tier");
        }
        Ok(())
    }

    /// Live entry of one tier. An entry found expired is also removed from
    /// the database.
    fn lookup(&self, tier: MemoryTier, id: &str, now: DateTime<Utc>) -> KernelResult<Option<MemoryEntry>> {
        let found = self.tier(tier)?.get(id, now);
        match found {
            Lookup::Live(entry) => Ok(Some(entry)),
            Lookup::Expired => {
                if let Some(repo) = self.persists(tier) {
                    repo.delete(id)?;
                }
                Ok(None)
            }
            Lookup::Missing => Ok(None),
        }
    }

    /// Fetch a live entry from any tier
    pub fn retrieve(&self, id: &str) -> KernelResult<MemoryEntry> {
        let now = Utc::now();
        for tier in MemoryTier::ALL {
            if let Some(entry) = self.lookup(tier, id, now)? {
                return Ok(entry);
            }
        }
        Err(KernelError::NotFound(format!("memory '{}'", id)))
    }

    /// Fetch a live entry from one tier
    pub fn retrieve_from(&self, tier: MemoryTier, id: &str) -> KernelResult<MemoryEntry> {
        self.lookup(tier, id, Utc::now())?
            .ok_or_else(|| KernelError::NotFound(format!("memory '{}' in {}", id, tier.as_str())))
    }

    /// Live entries matching `query` across all tiers, highest priority first,
    /// then newest first
    pub fn search(&self, query: &str, limit: usize) -> KernelResult<Vec<MemoryEntry>> {
        self.collect(limit, |e| e.matches(query))
    }

    /// Live entries carrying any of `tags`
    pub fn search_tags(&self, tags: &[&str], limit: usize) -> KernelResult<Vec<MemoryEntry>> {
        self.collect(limit, |e| e.tags.iter().any(|t| tags.contains(&t.as_str())))
    }

    fn collect<F>(&self, limit: usize, predicate: F) -> KernelResult<Vec<MemoryEntry>>
    where
        F: Fn(&MemoryEntry) -> bool,
    {
        let now = Utc::now();
        let mut hits = Vec::new();
        for tier in MemoryTier::ALL {
            let store = self.tier(tier)?;
            hits.extend(store.live(now).filter(|e| predicate(e)).cloned());
        }
        hits.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// Remove an entry from whichever tier holds it
    pub fn delete(&self, id: &str) -> KernelResult<bool> {
        let _placement = self.placement.lock().map_err(KernelError::lock)?;
        for tier in MemoryTier::ALL {
            let removed = self.tier(tier)?.remove(id);
            if removed.is_some() {
                if let Some(repo) = self.persists(tier) {
                    repo.delete(id)?;
                }
                self.emit(
                    EventKind::MemoryDeleted,
                    json!({ "id": id, "tier": tier.as_str() }),
                );
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Move a live entry to another tier. Entries entering a durable tier
    /// lose their TTL.
    pub fn promote(&self, id: &str, target: MemoryTier) -> KernelResult<()> {
        let _placement = self.placement.lock().map_err(KernelError::lock)?;
        let now = Utc::now();
        for tier in MemoryTier::ALL {
            if tier == target {
                continue;
            }
            let taken = {
                let mut store = self.tier(tier)?;
                match store.peek(id, now) {
                    Some(_) => store.remove(id),
                    None => None,
                }
            };
            if let Some(mut entry) = taken {
                if let Some(repo) = self.persists(tier) {
                    repo.delete(id)?;
                }
                entry.tier = target;
                if target != MemoryTier::ShortTerm {
                    entry.clear_ttl();
                }
                if let Some(repo) = self.persists(target) {
                    repo.save(&entry)?;
                }
                self.tier(target)?.insert(entry);
                tracing::debug!(id, from = tier.as_str(), to = target.as_str(), "Memory promoted");
                return Ok(());
            }
        }
        Err(KernelError::NotFound(format!("memory '{}'", id)))
    }

    /// Promote high and critical short-term entries to long-term and purge
    /// everything expired
    pub fn consolidate(&self) -> KernelResult<ConsolidationReport> {
        let purged = self.purge_expired()?;
        let candidates: Vec<String> = {
            let store = self.tier(MemoryTier::ShortTerm)?;
            store
                .live(Utc::now())
                .filter(|e| e.priority >= MemoryPriority::High)
                .map(|e| e.id.clone())
                .collect()
        };
        let mut promoted = 0;
        for id in candidates {
            self.promote(&id, MemoryTier::LongTerm)?;
            promoted += 1;
        }
        tracing::info!(promoted, purged, "Memory consolidated");
        Ok(ConsolidationReport { promoted, purged })
    }

    /// Text context built from the best search hits, capped at `max_chars`
    pub fn context(&self, query: &str, max_chars: usize) -> KernelResult<String> {
        let mut out = String::new();
        for entry in self.search(query, usize::MAX)? {
            let line = format!("[{}] {}\n", entry.tier.as_str(), entry.text());
            if out.len() + line.len() > max_chars {
                break;
            }
            out.push_str(&line);
        }
        Ok(out)
    }

    /// Physically remove expired entries from every tier
    pub fn purge_expired(&self) -> KernelResult<usize> {
        let now = Utc::now();
        let mut purged = 0;
        for tier in MemoryTier::ALL {
            let removed = self.tier(tier)?.purge_expired(now);
            if let Some(repo) = self.persists(tier) {
                for id in &removed {
                    repo.delete(id)?;
                }
            }
            purged += removed.len();
        }
        Ok(purged)
    }

    /// Periodically purge expired entries until the manager is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                match manager.purge_expired() {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!(purged = n, "Memory sweep"),
                    Err(e) => tracing::warn!(error = %e, "Memory sweep failed"),
                }
            }
        })
    }

    pub fn stats(&self) -> KernelResult<MemoryStats> {
        let now = Utc::now();
        let mut stats = MemoryStats::default();
        for tier in MemoryTier::ALL {
            let store = self.tier(tier)?;
            let live = store.len() - store.expired_count(now);
            stats.expired_pending += store.expired_count(now);
            match tier {
                MemoryTier::ShortTerm => stats.short_term = live,
                MemoryTier::LongTerm => stats.long_term = live,
                MemoryTier::Semantic => stats.semantic = live,
                MemoryTier::Episodic => stats.episodic = live,
            }
        }
        let episodes = self.episodes.lock().map_err(KernelError::lock)?;
        stats.episodes = episodes.len();
        stats.open_episodes = episodes.values().filter(|e| e.is_open()).count();
        Ok(stats)
    }

    // =========================================================================
    // Semantic facts
    // =========================================================================

    /// Insert or replace a fact
    pub fn upsert_fact(
        &self,
        fact_id: &str,
        content: serde_json::Value,
        confidence: f64,
        source: Option<&str>,
    ) -> KernelResult<()> {
        let mut options = StoreOptions::new()
            .id(fact_id)
            .metadata(CONFIDENCE_KEY, json!(confidence.clamp(0.0, 1.0)));
        if let Some(source) = source {
            options = options.metadata(SOURCE_KEY, json!(source));
        }
        self.store(content, MemoryTier::Semantic, options)?;
        Ok(())
    }

    pub fn get_fact(&self, fact_id: &str) -> KernelResult<Fact> {
        let entry = self.retrieve_from(MemoryTier::Semantic, fact_id)?;
        Ok(Fact::from(&entry))
    }

    /// Facts at or above a confidence threshold
    pub fn facts(&self, min_confidence: f64) -> KernelResult<Vec<Fact>> {
        let store = self.tier(MemoryTier::Semantic)?;
        let mut facts: Vec<Fact> = store
            .live(Utc::now())
            .map(Fact::from)
            .filter(|f| f.confidence >= min_confidence)
            .collect();
        facts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(facts)
    }

    // =========================================================================
    // Episodes
    // =========================================================================

    /// Open an episode. Starting an already-open episode is a no-op.
    pub fn start_episode(&self, name: &str) -> KernelResult<()> {
        let mut episodes = self.episodes.lock().map_err(KernelError::lock)?;
        match episodes.get(name) {
            Some(episode) if !episode.is_open() => Err(KernelError::EpisodeClosed(name.to_string())),
            Some(_) => Ok(()),
            None => {
                episodes.insert(name.to_string(), Episode::new(name));
                Ok(())
            }
        }
    }

    /// Append an event to an open episode
    pub fn record_event(&self, name: &str, kind: &str, data: serde_json::Value) -> KernelResult<()> {
        let mut episodes = self.episodes.lock().map_err(KernelError::lock)?;
        let episode = episodes
            .get_mut(name)
            .ok_or_else(|| KernelError::NotFound(format!("episode '{}'", name)))?;
        if !episode.is_open() {
            return Err(KernelError::EpisodeClosed(name.to_string()));
        }
        episode.record(kind, data);
        Ok(())
    }

    /// Close an episode and archive it as an episodic-tier entry keyed by name
    pub fn end_episode(&self, name: &str) -> KernelResult<Episode> {
        let episode = {
            let mut episodes = self.episodes.lock().map_err(KernelError::lock)?;
            let episode = episodes
                .get_mut(name)
                .ok_or_else(|| KernelError::NotFound(format!("episode '{}'", name)))?;
            if !episode.is_open() {
                return Err(KernelError::EpisodeClosed(name.to_string()));
            }
            episode.close();
            episode.clone()
        };
        self.store(
            serde_json::to_value(&episode)?,
            MemoryTier::Episodic,
            StoreOptions::new().id(name).tags(["episode"]),
        )?;
        Ok(episode)
    }

    pub fn episode(&self, name: &str) -> KernelResult<Episode> {
        let episodes = self.episodes.lock().map_err(KernelError::lock)?;
        episodes
            .get(name)
            .cloned()
            .ok_or_else(|| KernelError::NotFound(format!("episode '{}'", name)))
    }
}
