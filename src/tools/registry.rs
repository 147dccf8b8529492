//! Tool registry for managing available tools.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::agent::COMPLETE_JOB_TOOL;
use crate::context::JobContext;
use crate::llm::ToolDefinition;
use crate::tools::tool::{Tool, ToolError, Toolbox};

/// Names no registered tool may take.
const RESERVED_TOOL_NAMES: &[&str] = &[COMPLETE_JOB_TOOL];

/// Registry of available tools.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    /// Names registered at startup, protected from shadowing.
    builtin_names: RwLock<HashSet<String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            builtin_names: RwLock::new(HashSet::new()),
        }
    }

    /// Register a tool. Rejects reserved names and tools that would shadow a built-in.
    pub async fn register(&self, tool: Arc<dyn Tool>) -> bool {
        let name = tool.name().to_string();
        if RESERVED_TOOL_NAMES.contains(&name.as_str()) {
            tracing::warn!(tool = %name, "Rejected tool registration: reserved name");
            return false;
        }
        if self.builtin_names.read().await.contains(&name) {
            tracing::warn!(
                tool = %name,
                "Rejected tool registration: would shadow a built-in tool"
            );
            return false;
        }
        self.tools.write().await.insert(name.clone(), tool);
        tracing::debug!("Registered tool: {}", name);
        true
    }

    /// Register a built-in tool (startup only).
    pub async fn register_builtin(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.register(tool).await {
            self.builtin_names.write().await.insert(name);
        }
    }

    pub async fn unregister(&self, name: &str) -> Option<Arc<dyn Tool>> {
        if self.builtin_names.read().await.contains(name) {
            return None;
        }
        self.tools.write().await.remove(name)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn has(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    /// All tool names, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn count(&self) -> usize {
        self.tools.read().await.len()
    }

    /// Get tool definitions for LLM function calling.
    pub async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .read()
            .await
            .values()
            .map(|tool| definition_of(tool.as_ref()))
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Toolbox for ToolRegistry {
    async fn load(&self, _ctx: &JobContext) -> Result<Vec<Arc<dyn Tool>>, ToolError> {
        let mut tools: Vec<Arc<dyn Tool>> = self.tools.read().await.values().cloned().collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(tools)
    }
}

/// Schema the model sees for `tool`.
pub fn definition_of(tool: &dyn Tool) -> ToolDefinition {
    ToolDefinition {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        parameters: tool.parameters_schema(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tool::ToolOutput;
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Debug)]
    struct MockTool {
        name: String,
    }

    #[async_trait]
    impl Tool for MockTool {
        fn name(&self) -> &str {
            &self.name
        }
        fn description(&self) -> &str {
            "A mock tool for testing"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn execute(
            &self,
            _params: serde_json::Value,
            _ctx: &JobContext,
        ) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text("mock", Duration::from_millis(1)))
        }
    }

    fn mock(name: &str) -> Arc<dyn Tool> {
        Arc::new(MockTool {
            name: name.to_string(),
        })
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = ToolRegistry::new();
        assert!(registry.register(mock("test_tool")).await);
        assert!(registry.has("test_tool").await);
        assert!(!registry.has("nonexistent").await);
        assert_eq!(registry.get("test_tool").await.unwrap().name(), "test_tool");
    }

    #[tokio::test]
    async fn test_completion_tool_name_is_reserved() {
        let registry = ToolRegistry::new();
        assert!(!registry.register(mock(COMPLETE_JOB_TOOL)).await);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_builtin_cannot_be_shadowed_or_removed() {
        let registry = ToolRegistry::new();
        registry.register_builtin(mock("current_time")).await;
        assert!(!registry.register(mock("current_time")).await);
        assert!(registry.unregister("current_time").await.is_none());
        assert!(registry.has("current_time").await);
    }

    #[tokio::test]
    async fn test_load_and_definitions_are_sorted() {
        let registry = ToolRegistry::new();
        registry.register(mock("b")).await;
        registry.register(mock("a")).await;

        let ctx = JobContext::new(Uuid::new_v4(), "job", "prompt");
        let loaded = registry.load(&ctx).await.unwrap();
        let names: Vec<_> = loaded.iter().map(|t| t.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let defs = registry.tool_definitions().await;
        assert_eq!(defs[0].name, "a");
        assert_eq!(registry.list().await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = ToolRegistry::new();
        registry.register(mock("temp")).await;
        assert!(registry.unregister("temp").await.is_some());
        assert!(!registry.has("temp").await);
    }
}
