//! # Tool Definitions
//!
//! A tool is a named async capability with a JSON input/output contract.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Broad grouping used for listing and analytics
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Database,
    FileSystem,
    Llm,
    Validation,
    Transformation,
    ExternalApi,
    Pipeline,
    System,
}

/// Static description of a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub category: ToolCategory,
    /// JSON schema of the arguments object
    #[serde(default)]
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub output_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl ToolSpec {
    pub fn new(name: &str, description: &str, category: ToolCategory) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            category,
            input_schema: serde_json::json!({ "type": "object" }),
            output_schema: None,
            timeout: None,
        }
    }

    /// Derive the input contract from a type
    pub fn with_input<T: JsonSchema>(mut self) -> Self {
        self.input_schema = serde_json::to_value(schemars::schema_for!(T)).unwrap_or_default();
        self
    }

    pub fn with_input_schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Derive the output contract from a type
    pub fn with_output<T: JsonSchema>(mut self) -> Self {
        self.output_schema = serde_json::to_value(schemars::schema_for!(T)).ok();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fields listed under `required` in the input schema
    pub fn required_fields(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|fields| fields.iter().filter_map(|f| f.as_str()).collect())
            .unwrap_or_default()
    }

    /// Shape exposed to tool-calling surfaces
    pub fn function_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "category": self.category,
            "parameters": self.input_schema,
        })
    }
}

/// A callable capability
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> &ToolSpec;

    async fn call(&self, args: serde_json::Value) -> anyhow::Result<serde_json::Value>;
}

type BoxedCall = Box<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = anyhow::Result<serde_json::Value>> + Send>>
        + Send
        + Sync,
>;

/// Tool backed by an async closure
pub struct FnTool {
    spec: ToolSpec,
    call: BoxedCall,
}

impl FnTool {
    pub fn new<F, Fut>(spec: ToolSpec, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        Self {
            spec,
            call: Box::new(move |args| Box::pin(f(args))),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn call(&self, args: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        (self.call)(args).await
    }
}

/// Uniform wrapper around every tool invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default)]
    pub data: serde_json::Value,
    pub error: Option<String>,
    pub duration_ms: f64,
}

impl ToolResult {
    pub fn ok(data: serde_json::Value, duration_ms: f64) -> Self {
        Self {
            success: true,
            data,
            error: None,
            duration_ms,
        }
    }

    pub fn failed(error: impl Into<String>, duration_ms: f64) -> Self {
        Self {
            success: false,
            data: serde_json::Value::Null,
            error: Some(error.into()),
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(JsonSchema, Deserialize)]
    #[allow(dead_code)]
    struct BuildArgs {
        input_path: String,
        #[serde(default)]
        verbose: bool,
    }

    #[test]
    fn test_required_fields_from_derived_schema() {
        let spec = ToolSpec::new("build", "Generate artifacts", ToolCategory::Transformation)
            .with_input::<BuildArgs>();
        assert_eq!(spec.required_fields(), vec!["input_path"]);
        assert_eq!(spec.function_schema()["name"], "build");
    }

    #[tokio::test]
    async fn test_fn_tool_calls_closure() {
        let tool = FnTool::new(
            ToolSpec::new("echo", "Echo arguments", ToolCategory::System),
            |args| async move { Ok(args) },
        );
        let out = tool.call(serde_json::json!({ "x": 1 })).await.unwrap();
        assert_eq!(out["x"], 1);
    }
}
