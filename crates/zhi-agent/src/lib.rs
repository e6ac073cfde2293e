//! zhi agent: orchestrator loop, safety gate, tools, and skills.
//!
//! This crate contains:
//! - **agent_loop**: the LLM ↔ tool-calling state machine and its context
//! - **conversation**: message history with tool-call bookkeeping
//! - **observer**: progress callbacks for the UI
//! - **safety** / **permission**: who may run what, and asking the user
//! - **sandbox**: where file-creating tools may write
//! - **skills**: skill loading, call chains, nested toolsets
//! - **tools**: the Tool trait, registry, and built-in tools

pub mod agent_loop;
pub mod conversation;
pub mod error;
pub mod observer;
pub mod permission;
pub mod safety;
pub mod sandbox;
pub mod skills;
pub mod tools;

#[cfg(test)]
pub(crate) mod testing;

pub use agent_loop::{AgentContext, AgentContextBuilder, AgentLoop, RunOutcome, RunScope};
pub use conversation::{ConversationError, ConversationState, UsageTotals};
pub use error::{AgentError, ToolFailure};
pub use observer::RunObserver;
pub use permission::{PermissionController, PermissionDecision, PermissionRequest};
pub use safety::{Authorization, CommandClass, SafetyGate, ShellClassifier};
pub use sandbox::{OutputSandbox, SandboxError, SandboxPath};
pub use skills::{SkillDefinition, SkillError, SkillLoader, SkillSet, SkillSource};
pub use tools::{RiskTier, Tool, ToolRegistry};
