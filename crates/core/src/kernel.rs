//! # Kernel
//!
//! The shared services of one process, built once from a [`KernelConfig`]
//! and handed around as `Arc`s.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::events::EventBus;
use crate::graph::{CheckpointStore, GraphOptions, GraphServices};
use crate::hooks::HookManager;
use crate::memory::MemoryManager;
use crate::storage::{KernelDb, MemoryRepository, RunSummaryStore, SqliteCheckpointStore};
use crate::tools::ToolRegistry;
use crate::tracer::Tracer;

pub struct Kernel {
    pub config: KernelConfig,
    pub events: Arc<EventBus>,
    pub hooks: Arc<HookManager>,
    pub tracer: Arc<Tracer>,
    pub tools: Arc<ToolRegistry>,
    pub memory: Arc<MemoryManager>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub summaries: RunSummaryStore,
    db: KernelDb,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Kernel {
    /// Open the database at the configured path and wire every service
    pub fn new(config: KernelConfig) -> KernelResult<Self> {
        let db = KernelDb::open_at(config.db_path())?;
        Self::assemble(config, db)
    }

    /// Kernel backed by a private in-memory database
    pub fn in_memory(config: KernelConfig) -> KernelResult<Self> {
        let db = KernelDb::open_in_memory()?;
        Self::assemble(config, db)
    }

    fn assemble(config: KernelConfig, db: KernelDb) -> KernelResult<Self> {
        let events = Arc::new(EventBus::new(config.events.max_history));
        let hooks = Arc::new(HookManager::default());
        let tracer = Arc::new(Tracer::from_config(&config.tracing)?);
        let tools = Arc::new(
            ToolRegistry::new(Arc::clone(&events), Arc::clone(&tracer))
                .with_hooks(Arc::clone(&hooks))
                .with_default_timeout(
                    config
                        .tools
                        .default_timeout_secs
                        .map(|s| Duration::from_secs_f64(s.max(0.0))),
                )
                .with_max_history(config.tools.max_history),
        );

        let mut memory = MemoryManager::new(config.memory.clone()).with_events(Arc::clone(&events));
        if config.memory.persist {
            memory = memory.with_repository(MemoryRepository::new(&db))?;
        }

        tracing::info!(
            max_parallel = config.graph.max_parallel,
            persist_memory = config.memory.persist,
            "Kernel initialized"
        );

        Ok(Self {
            checkpoints: Arc::new(SqliteCheckpointStore::new(&db)),
            summaries: RunSummaryStore::new(&db),
            memory: Arc::new(memory),
            config,
            events,
            hooks,
            tracer,
            tools,
            db,
            sweeper: Mutex::new(None),
        })
    }

    pub fn db(&self) -> &KernelDb {
        &self.db
    }

    pub fn graph_services(&self) -> GraphServices {
        GraphServices {
            events: Arc::clone(&self.events),
            hooks: Arc::clone(&self.hooks),
            tracer: Arc::clone(&self.tracer),
            checkpoints: Arc::clone(&self.checkpoints),
        }
    }

    pub fn graph_options(&self) -> GraphOptions {
        GraphOptions::from(&self.config.graph)
    }

    /// Start the memory sweeper if an interval is configured. Must be called
    /// inside a tokio runtime.
    pub fn start_background(&self) -> KernelResult<()> {
        let Some(secs) = self.config.memory.sweep_interval_secs else {
            return Ok(());
        };
        let mut sweeper = self.sweeper.lock().map_err(KernelError::lock)?;
        if sweeper.is_none() {
            *sweeper = Some(self.memory.spawn_sweeper(Duration::from_secs(secs.max(1))));
            tracing::debug!(interval_secs = secs, "Memory sweeper started");
        }
        Ok(())
    }

    /// Stop background tasks
    pub fn shutdown(&self) {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        tracing::info!("Kernel shut down");
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryTier, StoreOptions};

    #[tokio::test]
    async fn test_in_memory_kernel_wires_services() {
        let kernel = Kernel::in_memory(KernelConfig::default()).unwrap();
        kernel.start_background().unwrap();

        kernel
            .memory
            .store(
                serde_json::json!("schema notes"),
                MemoryTier::LongTerm,
                StoreOptions::new().id("notes"),
            )
            .unwrap();
        // Long-term entries are written through to the database
        let repo = MemoryRepository::new(kernel.db());
        assert_eq!(repo.load_tier(MemoryTier::LongTerm).unwrap().len(), 1);

        assert!(kernel.checkpoints.runs().unwrap().is_empty());
        assert_eq!(kernel.graph_options().max_total_steps, Some(1000));
        kernel.shutdown();
    }
}
