//! Tool registry: name → tool lookup for one toolset.
//!
//! The process-wide built-ins live in one registry on the agent context;
//! every run (top-level or nested skill) gets its own registry holding
//! exactly the tools it may call.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use zhi_core::types::ToolDefinition;

use super::base::Tool;
use crate::error::ToolFailure;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Tool '{0}' is already registered")]
pub struct DuplicateTool(pub String);

// ─────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Names are unique; a second tool with the same
    /// name is rejected.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), DuplicateTool> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            warn!(tool = %name, "duplicate tool registration rejected");
            return Err(DuplicateTool(name));
        }
        debug!(tool = %name, tier = %tool.risk_tier(), "registered tool");
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Names of all registered tools, sorted for determinism.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// LLM-facing definitions, sorted by name.
    pub fn get_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// Execute a tool by name. Does not consult the safety gate.
    pub async fn execute(
        &self,
        name: &str,
        params: HashMap<String, Value>,
    ) -> Result<String, ToolFailure> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolFailure::UnknownTool(name.to_string()))?;

        tool.execute(params).await.map_err(|e| {
            warn!(tool = name, error = %e, "tool execution failed");
            ToolFailure::execution(name, format!("{e:#}"))
        })
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .finish()
    }
}
