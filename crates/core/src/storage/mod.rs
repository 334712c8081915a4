//! # Storage
//!
//! SQLite persistence (`waypoint.db`) and runtime directory helpers.

pub mod checkpoints;
pub mod db;
pub mod io;
pub mod memories;
pub mod summaries;

pub use checkpoints::SqliteCheckpointStore;
pub use db::{KernelDb, DB_FILE};
pub use io::{get_runtime_path, read_json, write_json, RUNTIME_DIR, RUNTIME_PATH_ENV};
pub use memories::MemoryRepository;
pub use summaries::{PhaseRecord, RunSummary, RunSummaryStore};
