//! # Memory Module
//!
//! Four-tier memory for pipeline knowledge.
//!
//! ## Architecture
//!
//! ```text
//! short_term (TTL, capacity, LRU)   long_term (durable)
//! semantic (facts + confidence)     episodic (named event logs)
//!                    ↓
//!              MemoryManager
//!                    ↓
//!     MemoryRepository (SQLite write-through for durable tiers)
//! ```

pub mod entry;
pub mod episodic;
pub mod manager;
pub mod semantic;
mod store;

pub use entry::{MemoryEntry, MemoryPriority, MemoryTier, StoreOptions};
pub use episodic::{Episode, EpisodeEvent};
pub use manager::{ConsolidationReport, MemoryManager, MemoryStats};
pub use semantic::Fact;
