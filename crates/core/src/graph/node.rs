//! # Nodes
//!
//! Node handlers and the static declaration of a node.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;

use super::state::{StateUpdate, StateView};
use crate::tools::{ToolRegistry, ToolResult};

/// Work performed by a node
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn run(&self, input: StateView) -> anyhow::Result<StateUpdate>;
}

#[async_trait]
impl<F, Fut> NodeHandler for F
where
    F: Fn(StateView) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<StateUpdate>> + Send + 'static,
{
    async fn run(&self, input: StateView) -> anyhow::Result<StateUpdate> {
        (self)(input).await
    }
}

/// Static node declaration
pub(crate) struct NodeSpec {
    pub(crate) id: String,
    pub(crate) handler: Arc<dyn NodeHandler>,
    pub(crate) reads: BTreeSet<String>,
    pub(crate) writes: BTreeSet<String>,
    pub(crate) timeout: Option<Duration>,
}

/// Declares the read/write schema and timeout of a freshly added node
pub struct NodeBuilder<'a> {
    pub(crate) node: &'a mut NodeSpec,
}

impl<'a> NodeBuilder<'a> {
    pub fn reads<I, S>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node.reads.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn writes<I, S>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node.writes.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        self.node.timeout = Some(timeout);
        self
    }
}

/// Node that invokes a registered tool with its declared reads as the
/// argument object and stores the tool output under one key.
///
/// By default an unsuccessful tool result fails the node and only the
/// result data is stored. `keep_envelope` stores the whole [`ToolResult`]
/// instead and leaves routing on `success` to the graph's edges.
pub struct ToolNode {
    registry: Arc<ToolRegistry>,
    tool: String,
    output_key: String,
    run_context: bool,
    keep_envelope: bool,
}

impl ToolNode {
    pub fn new(registry: Arc<ToolRegistry>, tool: &str, output_key: &str) -> Self {
        Self {
            registry,
            tool: tool.to_string(),
            output_key: output_key.to_string(),
            run_context: false,
            keep_envelope: false,
        }
    }

    /// Also pass `run_id` and `retry_count` in the argument object
    pub fn with_run_context(mut self) -> Self {
        self.run_context = true;
        self
    }

    pub fn keep_envelope(mut self) -> Self {
        self.keep_envelope = true;
        self
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn output_key(&self) -> &str {
        &self.output_key
    }

    /// Invoke the tool for `input`. Errors only when the tool could not be
    /// called at all.
    pub async fn call(&self, input: &StateView) -> anyhow::Result<ToolResult> {
        let mut args = input.to_json();
        if self.run_context {
            if let Some(obj) = args.as_object_mut() {
                obj.insert("run_id".to_string(), json!(input.run_id));
                obj.insert("retry_count".to_string(), json!(input.retry_count));
            }
        }
        let result = self
            .registry
            .execute_in(&self.tool, &input.node_id, args, input.span())
            .await
            .with_context(|| format!("Node '{}' could not call tool '{}'", input.node_id, self.tool))?;
        Ok(result)
    }
}

#[async_trait]
impl NodeHandler for ToolNode {
    async fn run(&self, input: StateView) -> anyhow::Result<StateUpdate> {
        let result = self.call(&input).await?;
        if self.keep_envelope {
            return StateUpdate::new().set_json(&self.output_key, &result);
        }
        if !result.success {
            anyhow::bail!(
                "Tool '{}' failed: {}",
                self.tool,
                result.error.unwrap_or_default()
            );
        }
        Ok(StateUpdate::new().set(&self.output_key, result.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::graph::{GraphState, StateGraph};
    use crate::tools::{FnTool, ToolCategory, ToolSpec};
    use crate::tracer::Tracer;
    use serde_json::Value;

    fn registry() -> Arc<ToolRegistry> {
        let registry = ToolRegistry::new(Arc::new(EventBus::default()), Arc::new(Tracer::default()));
        registry
            .register(Arc::new(FnTool::new(
                ToolSpec::new("count_rows", "count rows of a table", ToolCategory::Database),
                |args: Value| async move {
                    let table = args["table"].as_str().unwrap_or_default().to_string();
                    anyhow::ensure!(!table.is_empty(), "no table given");
                    Ok(json!({ "table": table, "rows": 42, "retry": args.get("retry_count") }))
                },
            )))
            .unwrap();
        Arc::new(registry)
    }

    fn graph(node: ToolNode) -> StateGraph {
        let mut g = StateGraph::new("tool");
        g.add_node("count", node)
            .unwrap()
            .reads(["table"])
            .writes(["rows"]);
        g.set_entry_point("count").unwrap();
        g.set_finish_point("count").unwrap();
        g
    }

    #[tokio::test]
    async fn test_tool_node_stores_data() {
        let graph = graph(ToolNode::new(registry(), "count_rows", "rows")).compile().unwrap();
        let outcome = graph
            .execute(GraphState::new("t1").with("table", json!("orders")), 1)
            .await
            .unwrap();
        let rows = outcome.state.get("rows").unwrap();
        assert_eq!(rows["rows"], json!(42));
        assert!(rows["retry"].is_null());
    }

    #[tokio::test]
    async fn test_tool_node_failure_fails_node() {
        let graph = graph(ToolNode::new(registry(), "count_rows", "rows")).compile().unwrap();
        let err = graph.execute(GraphState::new("t2"), 1).await.unwrap_err();
        assert_eq!(err.failed_node(), Some("count"));
        assert!(err.to_string().contains("no table given"));
    }

    #[tokio::test]
    async fn test_envelope_keeps_failures_and_run_context() {
        let node = ToolNode::new(registry(), "count_rows", "rows")
            .with_run_context()
            .keep_envelope();
        let graph = graph(node).compile().unwrap();

        let outcome = graph.execute(GraphState::new("t3"), 1).await.unwrap();
        let envelope = outcome.state.get("rows").unwrap();
        assert_eq!(envelope["success"], json!(false));

        let outcome = graph
            .execute(GraphState::new("t4").with("table", json!("orders")), 1)
            .await
            .unwrap();
        let envelope = outcome.state.get("rows").unwrap();
        assert_eq!(envelope["success"], json!(true));
        assert_eq!(envelope["data"]["retry"], json!(0));
    }
}
