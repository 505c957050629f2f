//! Tool abstractions for agent function calling.
//!
//! Tools are registered in a [`ToolRegistry`] keyed by name and dispatched
//! through the type-erased [`DynTool`] interface. Every execution produces a
//! [`ToolExecutionRecord`] appended to the run's tool-execution log.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Definition of a tool exported to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON schema for the arguments object.
    pub parameters: Value,
}

impl ToolDefinition {
    /// Create a new tool definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Type-erased tool interface for dynamic dispatch.
#[async_trait]
pub trait DynTool: Send + Sync {
    /// Tool name (unique within a registry).
    fn name(&self) -> &str;

    /// Tool description shown to the model.
    fn description(&self) -> String;

    /// Definition exported to the model.
    fn definition(&self) -> ToolDefinition;

    /// Invoke the tool with a JSON arguments object.
    async fn call_json(&self, args: Value) -> Result<Value>;
}

/// Shared handle to a registered tool.
pub type BoxedTool = Arc<dyn DynTool>;

/// Registry of tools keyed by stable name.
///
/// Registration order does not matter; definitions are exported in name
/// order so tool lists are deterministic across runs.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, BoxedTool>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Duplicate names are rejected.
    pub fn register(&mut self, tool: BoxedTool) -> Result<()> {
        let name = tool.name().to_owned();
        if name.trim().is_empty() {
            return Err(Error::configuration("tool name must be non-empty"));
        }
        if self.tools.contains_key(&name) {
            return Err(Error::configuration(format!(
                "tool '{name}' is already registered"
            )));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Look up a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&BoxedTool> {
        self.tools.get(name)
    }

    /// Whether a tool with this name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Export all definitions in name order.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|tool| tool.definition()).collect()
    }
}

/// Normalized record for one tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    /// Executed tool name.
    pub tool_name: String,
    /// Provider tool-call identifier, when available.
    pub tool_call_id: Option<String>,
    /// Whether execution succeeded.
    pub success: bool,
    /// JSON-safe tool output payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error message when execution failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Execution latency in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct EchoTool;

    #[async_trait]
    impl DynTool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> String {
            "Echoes back the input message.".to_owned()
        }

        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new(
                "echo",
                self.description(),
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "message": {"type": "string"}
                    },
                    "required": ["message"]
                }),
            )
        }

        async fn call_json(&self, args: Value) -> Result<Value> {
            args.get("message").cloned().ok_or_else(|| {
                Error::invalid_arguments("missing required field 'message' (string)")
            })
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let err = registry.register(Arc::new(EchoTool)).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn call_json_dispatches() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let tool = registry.get("echo").unwrap();
        let out = tool
            .call_json(serde_json::json!({"message": "hello"}))
            .await
            .unwrap();
        assert_eq!(out, Value::String("hello".into()));
    }

    #[test]
    fn definitions_are_name_ordered() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
    }
}
