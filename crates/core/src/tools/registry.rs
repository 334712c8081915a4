//! # Tool Registry
//!
//! Name-indexed tool store with uniform invocation: contract check,
//! timeout, span, events and per-tool analytics.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::error::{KernelError, KernelResult};
use crate::events::{EventBus, EventKind};
use crate::hooks::{HookContext, HookManager, HookType};
use crate::tracer::{SpanContext, Tracer};

use super::tool::{Tool, ToolCategory, ToolResult, ToolSpec};

/// One past invocation
#[derive(Debug, Clone, Serialize)]
pub struct ToolExecution {
    pub tool: String,
    pub caller_id: String,
    pub success: bool,
    pub duration_ms: f64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated counters for one tool
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolAnalytics {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_time_ms: f64,
    pub last_used: Option<DateTime<Utc>>,
}

impl ToolAnalytics {
    pub fn avg_time_ms(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.total_time_ms / self.executions as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.successes as f64 / self.executions as f64
        }
    }
}

/// Registry of callable tools
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    history: Mutex<VecDeque<ToolExecution>>,
    max_history: usize,
    analytics: Mutex<HashMap<String, ToolAnalytics>>,
    default_timeout: Option<Duration>,
    events: Arc<EventBus>,
    tracer: Arc<Tracer>,
    hooks: Option<Arc<HookManager>>,
}

impl ToolRegistry {
    pub fn new(events: Arc<EventBus>, tracer: Arc<Tracer>) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            max_history: 1000,
            analytics: Mutex::new(HashMap::new()),
            default_timeout: None,
            events,
            tracer,
            hooks: None,
        }
    }

    /// Fire tool lifecycle hooks around every invocation
    pub fn with_hooks(mut self, hooks: Arc<HookManager>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Timeout applied to tools that do not declare one
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    pub fn register(&self, tool: Arc<dyn Tool>) -> KernelResult<()> {
        let name = tool.spec().name.clone();
        let mut tools = self.tools.write().map_err(KernelError::lock)?;
        if tools.contains_key(&name) {
            return Err(KernelError::DuplicateTool(name));
        }
        tracing::debug!(tool = %name, category = ?tool.spec().category, "Tool registered");
        tools.insert(name, tool);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> KernelResult<bool> {
        let mut tools = self.tools.write().map_err(KernelError::lock)?;
        Ok(tools.remove(name).is_some())
    }

    pub fn get(&self, name: &str) -> KernelResult<Arc<dyn Tool>> {
        let tools = self.tools.read().map_err(KernelError::lock)?;
        tools
            .get(name)
            .cloned()
            .ok_or_else(|| KernelError::ToolNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools
            .read()
            .map(|t| t.contains_key(name))
            .unwrap_or(false)
    }

    /// Tool specs, optionally restricted to one category, sorted by name
    pub fn list(&self, category: Option<ToolCategory>) -> Vec<ToolSpec> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        let mut specs: Vec<ToolSpec> = tools
            .values()
            .map(|t| t.spec())
            .filter(|s| category.map_or(true, |c| s.category == c))
            .cloned()
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Function-calling schemas for every tool
    pub fn schemas(&self) -> Vec<serde_json::Value> {
        self.list(None).iter().map(|s| s.function_schema()).collect()
    }

    /// Invoke a tool by name
    pub async fn execute(
        &self,
        name: &str,
        caller_id: &str,
        args: serde_json::Value,
    ) -> KernelResult<ToolResult> {
        self.execute_in(name, caller_id, args, None).await
    }

    /// Invoke a tool by name, nesting its span under `parent`
    #[tracing::instrument(skip(self, args, parent), fields(tool = %name, caller = %caller_id))]
    pub async fn execute_in(
        &self,
        name: &str,
        caller_id: &str,
        args: serde_json::Value,
        parent: Option<&SpanContext>,
    ) -> KernelResult<ToolResult> {
        let tool = self.get(name)?;
        let spec = tool.spec().clone();

        let mut span = self.tracer.start_span(&format!("tool.{}", name), parent);
        span.set_attribute("tool.name", name);
        span.set_attribute("tool.caller", caller_id);

        if let Some(hooks) = &self.hooks {
            let ctx = hooks
                .trigger(HookContext::new(HookType::BeforeToolCall, name).with_data("args", args.clone()))
                .await;
            if !ctx.should_continue {
                let result = ToolResult::failed("Tool call refused by hook", 0.0);
                span.set_error("refused by hook");
                self.tracer.end_span(span);
                self.finish(&spec, caller_id, &result).await;
                return Ok(result);
            }
        }

        let started = Instant::now();
        let result = match missing_field(&spec, &args) {
            Some(field) => ToolResult::failed(format!("Missing required parameter: {}", field), 0.0),
            None => {
                let timeout = spec.timeout.or(self.default_timeout);
                let outcome = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, tool.call(args)).await {
                        Ok(r) => r,
                        Err(_) => Err(anyhow::anyhow!("Tool '{}' timed out after {:?}", name, limit)),
                    },
                    None => tool.call(args).await,
                };
                let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                match outcome {
                    Ok(data) => ToolResult::ok(data, elapsed),
                    Err(e) => ToolResult::failed(format!("{:#}", e), elapsed),
                }
            }
        };

        span.set_attribute("tool.success", result.success);
        match &result.error {
            Some(err) => span.set_error(err),
            None => span.set_ok(),
        }
        self.tracer.end_span(span);
        self.finish(&spec, caller_id, &result).await;
        Ok(result)
    }

    async fn finish(&self, spec: &ToolSpec, caller_id: &str, result: &ToolResult) {
        let payload = json!({
            "tool": spec.name,
            "caller": caller_id,
            "success": result.success,
            "duration_ms": result.duration_ms,
            "error": result.error,
        });
        if result.success {
            self.events.emit(EventKind::ToolInvoked, caller_id, payload);
        } else {
            tracing::warn!(tool = %spec.name, error = ?result.error, "Tool failed");
            self.events.emit(EventKind::ToolFailed, caller_id, payload);
        }

        let status = if result.success { "ok" } else { "error" };
        let metrics = self.tracer.metrics();
        metrics.increment("tool.calls", 1, &[("tool", spec.name.as_str()), ("status", status)]);
        metrics.histogram("tool.duration_ms", result.duration_ms, &[("tool", spec.name.as_str())]);

        if let Some(hooks) = &self.hooks {
            let ctx = if result.success {
                HookContext::new(HookType::AfterToolCall, &spec.name).with_data("result", result.data.clone())
            } else {
                HookContext::new(HookType::OnToolError, &spec.name)
                    .with_error(result.error.as_deref().unwrap_or_default())
            };
            hooks.trigger(ctx).await;
        }

        self.record(ToolExecution {
            tool: spec.name.clone(),
            caller_id: caller_id.to_string(),
            success: result.success,
            duration_ms: result.duration_ms,
            error: result.error.clone(),
            timestamp: Utc::now(),
        });
    }

    fn record(&self, execution: ToolExecution) {
        {
            let mut analytics = self.analytics.lock().unwrap_or_else(|e| e.into_inner());
            let entry = analytics.entry(execution.tool.clone()).or_default();
            entry.executions += 1;
            if execution.success {
                entry.successes += 1;
            } else {
                entry.failures += 1;
            }
            entry.total_time_ms += execution.duration_ms;
            entry.last_used = Some(execution.timestamp);
        }

        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(execution);
        while history.len() > self.max_history {
            history.pop_front();
        }
    }

    /// Most recent executions, newest last
    pub fn history(&self, limit: usize) -> Vec<ToolExecution> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn analytics(&self) -> HashMap<String, ToolAnalytics> {
        self.analytics
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }
}

fn missing_field<'a>(spec: &'a ToolSpec, args: &serde_json::Value) -> Option<&'a str> {
    spec.required_fields()
        .into_iter()
        .find(|field| args.get(*field).map_or(true, |v| v.is_null()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookPriority;
    use crate::tools::FnTool;

    fn registry() -> ToolRegistry {
        ToolRegistry::new(Arc::new(EventBus::default()), Arc::new(Tracer::default()))
    }

    fn echo() -> Arc<dyn Tool> {
        Arc::new(FnTool::new(
            ToolSpec::new("echo", "Echo input", ToolCategory::System).with_input_schema(json!({
                "type": "object",
                "properties": { "msg": { "type": "string" } },
                "required": ["msg"]
            })),
            |args| async move { Ok(json!({ "echo": args["msg"] })) },
        ))
    }

    #[tokio::test]
    async fn test_unknown_tool_is_an_error() {
        let reg = registry();
        let err = reg.execute("missing", "test", json!({})).await.unwrap_err();
        assert!(matches!(err, KernelError::ToolNotFound(name) if name == "missing"));
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let reg = registry();
        reg.register(echo()).unwrap();
        assert!(matches!(reg.register(echo()), Err(KernelError::DuplicateTool(_))));
        assert!(reg.unregister("echo").unwrap());
        assert!(!reg.contains("echo"));
    }

    #[tokio::test]
    async fn test_execute_success_and_missing_param() {
        let events = Arc::new(EventBus::default());
        let tracer = Arc::new(Tracer::default());
        let reg = ToolRegistry::new(events.clone(), tracer.clone());
        reg.register(echo()).unwrap();

        let ok = reg.execute("echo", "node-a", json!({ "msg": "hi" })).await.unwrap();
        assert!(ok.success);
        assert_eq!(ok.data["echo"], "hi");

        let bad = reg.execute("echo", "node-a", json!({})).await.unwrap();
        assert!(!bad.success);
        assert!(bad.error.unwrap().contains("msg"));

        assert_eq!(events.history_of(&EventKind::ToolInvoked).len(), 1);
        assert_eq!(events.history_of(&EventKind::ToolFailed).len(), 1);
        assert_eq!(tracer.stats().by_name.get("tool.echo"), Some(&2));
        let metrics = tracer.metrics().snapshot();
        assert_eq!(metrics.histograms["tool.duration_ms{tool=echo}"].count, 2);
        assert_eq!(metrics.counters["tool.calls{status=error,tool=echo}"], 1);
        assert_eq!(metrics.counters["tool.calls{status=ok,tool=echo}"], 1);

        let stats = &reg.analytics()["echo"];
        assert_eq!(stats.executions, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(reg.history(10).len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_and_handler_error() {
        let reg = registry();
        reg.register(Arc::new(FnTool::new(
            ToolSpec::new("slow", "Sleeps", ToolCategory::System)
                .with_timeout(Duration::from_millis(20)),
            |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!(null))
            },
        )))
        .unwrap();
        reg.register(Arc::new(FnTool::new(
            ToolSpec::new("broken", "Fails", ToolCategory::System),
            |_| async { anyhow::bail!("connection refused") },
        )))
        .unwrap();

        let slow = reg.execute("slow", "t", json!({})).await.unwrap();
        assert!(!slow.success);
        assert!(slow.error.unwrap().contains("timed out"));

        let broken = reg.execute("broken", "t", json!({})).await.unwrap();
        assert_eq!(broken.error.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn test_list_by_category_and_hook_veto() {
        let hooks = Arc::new(HookManager::default());
        hooks.register_fn("deny", HookType::BeforeToolCall, HookPriority::Normal, |ctx: &mut HookContext| {
            if ctx.source == "echo" {
                ctx.halt();
            }
            Ok(())
        });
        let reg = registry().with_hooks(hooks);
        reg.register(echo()).unwrap();
        reg.register(Arc::new(FnTool::new(
            ToolSpec::new("check", "Validate", ToolCategory::Validation),
            |_| async { Ok(json!({ "passed": true })) },
        )))
        .unwrap();

        assert_eq!(reg.list(Some(ToolCategory::Validation)).len(), 1);
        assert_eq!(reg.schemas().len(), 2);

        let vetoed = reg.execute("echo", "t", json!({ "msg": "x" })).await.unwrap();
        assert!(!vetoed.success);
        let allowed = reg.execute("check", "t", json!({})).await.unwrap();
        assert!(allowed.success);
    }
}
