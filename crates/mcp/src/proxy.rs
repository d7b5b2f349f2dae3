//! Adapter exposing remote tools through the core `Tool` trait.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use krait_core::error::ToolError;
use krait_core::tool::{Tool, ToolDefinition, ToolResult};

use crate::manager::McpManager;

/// A registry entry that forwards to the manager by alias.
pub struct McpProxyTool {
    manager: Arc<McpManager>,
    definition: ToolDefinition,
}

#[async_trait]
impl Tool for McpProxyTool {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn description(&self) -> &str {
        &self.definition.description
    }

    fn parameters_schema(&self) -> Value {
        self.definition.parameters.clone()
    }

    async fn execute(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        // The manager absorbs transport trouble into error results.
        Ok(self.manager.call(&self.definition.name, arguments).await)
    }
}

/// Proxy tools for everything currently connected, ready to register.
pub async fn proxy_tools(manager: &Arc<McpManager>) -> Vec<Arc<dyn Tool>> {
    manager
        .tool_definitions()
        .await
        .into_iter()
        .map(|definition| {
            Arc::new(McpProxyTool {
                manager: Arc::clone(manager),
                definition,
            }) as Arc<dyn Tool>
        })
        .collect()
}
