//! Tool port and the built-in research tools.

pub mod fetch;
pub mod search;

use crate::config::ToolsConfig;
use async_trait::async_trait;
use quarry_core::{QuarryError, QuarryResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub use fetch::FetchTool;
pub use search::{extract_sources, SearchTool};

/// Metadata describing a tool's interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// Example invocation shown to the model.
    pub usage: String,
}

/// A single research tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    async fn execute(&self, args: &serde_json::Value) -> QuarryResult<String>;
}

/// What the ReAct agent calls to run tools. Errors are reported back to the
/// model as observations, never propagated out of the worker.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, args: &serde_json::Value) -> QuarryResult<String>;

    fn tool_names(&self) -> Vec<String>;

    /// Descriptors used to build the system prompt.
    fn descriptors(&self) -> Vec<ToolDescriptor> {
        Vec::new()
    }
}

/// Central registry for all available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `search` and `fetch` configured from `config`.
    pub fn with_defaults(config: &ToolsConfig) -> QuarryResult<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(SearchTool::new(config)?));
        registry.register(Arc::new(FetchTool::new(config)?));
        Ok(registry)
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.descriptor().name.clone();
        info!(tool = %name, "Registered tool");
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(&self, name: &str, args: &serde_json::Value) -> QuarryResult<String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| QuarryError::Tool(format!("Unknown tool: {name}")))?;
        tool.execute(args).await
    }

    fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.values().map(|t| t.descriptor().clone()).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    struct Echo {
        descriptor: ToolDescriptor,
    }

    #[async_trait]
    impl Tool for Echo {
        fn descriptor(&self) -> &ToolDescriptor {
            &self.descriptor
        }

        async fn execute(&self, args: &serde_json::Value) -> QuarryResult<String> {
            Ok(args.to_string())
        }
    }

    fn echo() -> Arc<dyn Tool> {
        Arc::new(Echo {
            descriptor: ToolDescriptor {
                name: "echo".into(),
                description: "Echoes arguments".into(),
                usage: r#"<tool name="echo">{}</tool>"#.into(),
            },
        })
    }

    #[tokio::test]
    async fn test_registry_dispatch() {
        let mut registry = ToolRegistry::new();
        registry.register(echo());
        assert_eq!(registry.tool_names(), vec!["echo".to_string()]);

        let out = registry
            .execute("echo", &serde_json::json!({"q": 1}))
            .await
            .unwrap();
        assert_eq!(out, r#"{"q":1}"#);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute("nope", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, QuarryError::Tool(_)));
    }

    #[test]
    fn test_defaults_register_search_and_fetch() {
        let registry = ToolRegistry::with_defaults(&ToolsConfig::default()).unwrap();
        assert_eq!(registry.tool_names(), vec!["fetch", "search"]);
        assert_eq!(registry.descriptors().len(), 2);
    }
}
