//! Error types for the agent crate.
//!
//! [`ToolFailure`] covers everything the model can cause; it is always
//! rendered into a tool-result and the loop keeps going. [`AgentError`]
//! ends a run.

use thiserror::Error;
use zhi_providers::ProviderError;

use crate::sandbox::SandboxError;
use crate::skills::ResolveError;

#[derive(Debug, Error)]
pub enum ToolFailure {
    #[error("Error: Unknown tool '{0}'")]
    UnknownTool(String),

    #[error("Permission denied by user")]
    PermissionDenied,

    #[error("Error: Command blocked for safety. {0}")]
    CommandBlocked(String),

    #[error("Error executing {tool}: {message}")]
    Execution { tool: String, message: String },

    #[error("Error: {0}")]
    PathRejected(#[from] SandboxError),

    #[error("Error: {0}")]
    Recursion(#[from] ResolveError),
}

impl ToolFailure {
    pub fn execution(tool: &str, err: impl std::fmt::Display) -> Self {
        ToolFailure::Execution {
            tool: tool.to_string(),
            message: err.to_string(),
        }
    }
}

/// Conditions that stop the orchestrator.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("LLM provider failed: {0}")]
    Provider(#[from] ProviderError),
}
