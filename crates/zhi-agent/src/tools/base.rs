//! Tool trait: the interface every agent tool implements.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use zhi_core::config::PermissionMode;
use zhi_core::types::ToolDefinition;

use crate::error::ToolFailure;

// ─────────────────────────────────────────────
// Risk tiers
// ─────────────────────────────────────────────

/// How much user consent a tool needs before it runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RiskTier {
    /// Read-only or otherwise harmless; never asks.
    Low,
    /// Side effects; asks in approve mode only.
    High,
    /// Asks in every mode.
    Always,
}

impl RiskTier {
    pub fn requires_confirmation(self, mode: PermissionMode) -> bool {
        match (self, mode) {
            (RiskTier::Low, _) => false,
            (RiskTier::High, PermissionMode::Approve) => true,
            (RiskTier::High, PermissionMode::Auto) => false,
            (RiskTier::Always, _) => true,
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskTier::Low => "low",
            RiskTier::High => "high",
            RiskTier::Always => "always",
        };
        f.write_str(s)
    }
}

// ─────────────────────────────────────────────
// Tool trait
// ─────────────────────────────────────────────

/// Every agent tool implements this trait.
///
/// The orchestrator sends `to_definition()` to the model, runs the call
/// through the safety gate, and then dispatches to `execute()`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name the model uses to call this tool (e.g. `"file_read"`).
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema of the arguments:
    /// `{"type": "object", "properties": {...}, "required": [...]}`.
    fn parameters(&self) -> Value;

    fn risk_tier(&self) -> RiskTier {
        RiskTier::Low
    }

    /// The command line this call would run, for shell-class tools.
    ///
    /// Returning `Some` makes the safety gate classify the command and
    /// confirm it in every permission mode.
    fn shell_command(&self, _params: &HashMap<String, Value>) -> Option<String> {
        None
    }

    /// Checks that must pass before the user is asked for permission.
    fn preflight(&self, _params: &HashMap<String, Value>) -> Result<(), ToolFailure> {
        Ok(())
    }

    /// One-line summary of a call, shown in confirmation prompts.
    fn describe_call(&self, params: &HashMap<String, Value>) -> String {
        let args = serde_json::to_string(params).unwrap_or_default();
        format!("{}({})", self.name(), zhi_core::utils::truncate_string(&args, 200))
    }

    /// Run the tool. `Err` is reported to the model as
    /// `Error executing <name>: <error>`.
    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.parameters())
    }
}

// ─────────────────────────────────────────────
// Param helpers
// ─────────────────────────────────────────────

/// Extract a required non-empty `String` param.
pub fn require_string(params: &HashMap<String, Value>, key: &str) -> anyhow::Result<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Missing required parameter: {key}"))
}

pub fn optional_string(params: &HashMap<String, Value>, key: &str) -> Option<String> {
    params.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

/// Integers may arrive as JSON numbers or numeric strings.
pub fn optional_i64(params: &HashMap<String, Value>, key: &str) -> Option<i64> {
    match params.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// String array param; non-string items are skipped.
pub fn optional_string_list(params: &HashMap<String, Value>, key: &str) -> Option<Vec<String>> {
    params.get(key).and_then(|v| v.as_array()).map(|items| {
        items
            .iter()
            .filter_map(|i| i.as_str().map(String::from))
            .collect()
    })
}
