//! # Lifecycle Hooks
//!
//! Ordered interceptors around node, tool and phase lifecycle points.
//!
//! Hooks of one type run in priority order (lower value first), ties in
//! registration order. Any hook may clear `should_continue`; the remaining
//! hooks of that trigger are then skipped and, for `BeforeExecute`, the
//! node itself is skipped. A failing or timed-out hook is logged and the
//! trigger carries on with the next hook.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle point a hook attaches to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    BeforeExecute,
    AfterExecute,
    OnError,
    BeforeToolCall,
    AfterToolCall,
    OnToolError,
    OnPhaseTransition,
}

/// Execution order bucket
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum HookPriority {
    Highest = 0,
    High = 25,
    #[default]
    Normal = 50,
    Low = 75,
    Lowest = 100,
}

/// Mutable context threaded through every hook of one trigger
#[derive(Debug, Clone)]
pub struct HookContext {
    pub hook_type: HookType,
    /// Node, tool or controller that fired the trigger
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Cleared by a hook to stop the chain (and skip the node for `BeforeExecute`)
    pub should_continue: bool,
    /// Error message for `OnError` / `OnToolError` triggers
    pub error: Option<String>,
}

impl HookContext {
    pub fn new(hook_type: HookType, source: &str) -> Self {
        Self {
            hook_type,
            source: source.to_string(),
            timestamp: Utc::now(),
            data: serde_json::Map::new(),
            metadata: serde_json::Map::new(),
            should_continue: true,
            error: None,
        }
    }

    pub fn with_data(mut self, key: &str, value: serde_json::Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Refuse continuation
    pub fn halt(&mut self) {
        self.should_continue = false;
    }
}

/// A lifecycle interceptor
#[async_trait]
pub trait Hook: Send + Sync {
    async fn call(&self, ctx: &mut HookContext) -> anyhow::Result<()>;
}

struct FnHook<F>(F);

#[async_trait]
impl<F> Hook for FnHook<F>
where
    F: Fn(&mut HookContext) -> anyhow::Result<()> + Send + Sync,
{
    async fn call(&self, ctx: &mut HookContext) -> anyhow::Result<()> {
        (self.0)(ctx)
    }
}

/// Per-hook execution statistics
#[derive(Debug, Clone, Serialize)]
pub struct HookStats {
    pub name: String,
    /// `None` for global hooks
    pub hook_type: Option<HookType>,
    pub priority: HookPriority,
    pub enabled: bool,
    pub executions: u64,
    pub failures: u64,
    pub total_time_ms: f64,
    pub last_error: Option<String>,
}

struct Registration {
    seq: u64,
    handler: Arc<dyn Hook>,
    timeout: Duration,
    stats: HookStats,
}

/// Registry and dispatcher of hooks
pub struct HookManager {
    hooks: Mutex<Vec<Registration>>,
    next_seq: AtomicU64,
    paused: AtomicBool,
    default_timeout: Duration,
}

impl Default for HookManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl HookManager {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            hooks: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            default_timeout,
        }
    }

    /// Register a hook for one lifecycle point
    pub fn register(
        &self,
        name: &str,
        hook_type: HookType,
        priority: HookPriority,
        handler: Arc<dyn Hook>,
    ) {
        self.insert(name, Some(hook_type), priority, handler);
    }

    /// Register a synchronous closure as a hook
    pub fn register_fn<F>(&self, name: &str, hook_type: HookType, priority: HookPriority, f: F)
    where
        F: Fn(&mut HookContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert(name, Some(hook_type), priority, Arc::new(FnHook(f)));
    }

    /// Register a hook that runs for every lifecycle point
    pub fn register_global(&self, name: &str, priority: HookPriority, handler: Arc<dyn Hook>) {
        self.insert(name, None, priority, handler);
    }

    fn insert(
        &self,
        name: &str,
        hook_type: Option<HookType>,
        priority: HookPriority,
        handler: Arc<dyn Hook>,
    ) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
        hooks.push(Registration {
            seq,
            handler,
            timeout: self.default_timeout,
            stats: HookStats {
                name: name.to_string(),
                hook_type,
                priority,
                enabled: true,
                executions: 0,
                failures: 0,
                total_time_ms: 0.0,
                last_error: None,
            },
        });
        hooks.sort_by_key(|r| (r.stats.priority, r.seq));
        tracing::debug!(hook = name, ?hook_type, ?priority, "Hook registered");
    }

    /// Remove the first hook with this name
    pub fn unregister(&self, name: &str) -> bool {
        let mut hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
        match hooks.iter().position(|r| r.stats.name == name) {
            Some(idx) => {
                hooks.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn enable(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    pub fn disable(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
        match hooks.iter_mut().find(|r| r.stats.name == name) {
            Some(reg) => {
                reg.stats.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Suspend all hook execution
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Run every enabled hook for `ctx.hook_type` and return the final context
    pub async fn trigger(&self, mut ctx: HookContext) -> HookContext {
        if self.paused.load(Ordering::SeqCst) {
            return ctx;
        }

        let to_run: Vec<(u64, String, Arc<dyn Hook>, Duration)> = {
            let hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
            hooks
                .iter()
                .filter(|r| r.stats.enabled)
                .filter(|r| r.stats.hook_type.map_or(true, |t| t == ctx.hook_type))
                .map(|r| (r.seq, r.stats.name.clone(), Arc::clone(&r.handler), r.timeout))
                .collect()
        };

        for (seq, name, handler, timeout) in to_run {
            if !ctx.should_continue {
                break;
            }
            let started = Instant::now();
            let outcome = match tokio::time::timeout(timeout, handler.call(&mut ctx)).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("Hook '{}' failed: {}", name, e)),
                Err(_) => Some(format!("Hook '{}' timed out after {:?}", name, timeout)),
            };
            if let Some(err) = &outcome {
                tracing::warn!(hook = %name, hook_type = ?ctx.hook_type, error = %err, "Hook failed");
            }
            self.record(seq, started.elapsed(), outcome);
        }

        ctx
    }

    fn record(&self, seq: u64, elapsed: Duration, error: Option<String>) {
        let mut hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(reg) = hooks.iter_mut().find(|r| r.seq == seq) {
            reg.stats.executions += 1;
            reg.stats.total_time_ms += elapsed.as_secs_f64() * 1000.0;
            if error.is_some() {
                reg.stats.failures += 1;
                reg.stats.last_error = error;
            }
        }
    }

    /// Statistics for every registered hook, in execution order
    pub fn stats(&self) -> Vec<HookStats> {
        let hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
        hooks.iter().map(|r| r.stats.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
