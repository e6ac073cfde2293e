//! Call chain tracking for nested skill runs.
//!
//! Every skill invocation pushes an [`ExecutionFrame`] onto a [`CallChain`]
//! value that is handed down to the tools of the nested run. A skill may
//! appear only once in a chain, and a chain holds at most
//! [`MAX_SKILL_DEPTH`] frames.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use super::loader::SkillDefinition;
use crate::agent_loop::{AgentContext, RunScope};
use crate::tools::{FileWriteTool, SkillCreateTool, SkillTool, Tool, ToolRegistry};

pub const MAX_SKILL_DEPTH: usize = 3;

/// Prefix of the tool name a skill is exposed under.
pub const SKILL_TOOL_PREFIX: &str = "skill_";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Recursion blocked: '{name}' already in call chain [{}]", .chain.join(", "))]
    RecursionDetected { name: String, chain: Vec<String> },

    #[error("Recursion blocked: max depth ({max}) reached")]
    DepthExceeded { max: usize },
}

/// One active skill run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionFrame {
    pub skill: String,
    pub max_turns: u32,
    pub model: String,
    /// Tool names the skill declared, as written in its definition.
    pub allowed_tools: Vec<String>,
}

/// The chain of skill frames from the top-level conversation down to the
/// current run. The parent of a frame is the one before it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallChain {
    frames: Vec<ExecutionFrame>,
}

impl CallChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn contains(&self, skill: &str) -> bool {
        self.frames.iter().any(|f| f.skill == skill)
    }

    pub fn names(&self) -> Vec<String> {
        self.frames.iter().map(|f| f.skill.clone()).collect()
    }

    pub fn current(&self) -> Option<&ExecutionFrame> {
        self.frames.last()
    }

    /// A new chain with `frame` on top. `self` is left untouched, so the
    /// caller's chain is restored simply by dropping the child.
    pub fn push(&self, frame: ExecutionFrame) -> CallChain {
        let mut frames = self.frames.clone();
        frames.push(frame);
        CallChain { frames }
    }
}

/// Check that `skill` may run beneath `chain` and build its frame.
pub fn resolve(skill: &SkillDefinition, chain: &CallChain) -> Result<ExecutionFrame, ResolveError> {
    if chain.contains(&skill.name) {
        let err = ResolveError::RecursionDetected {
            name: skill.name.clone(),
            chain: chain.names(),
        };
        warn!(skill = %skill.name, chain = ?chain.names(), "skill recursion blocked");
        return Err(err);
    }
    if chain.depth() + 1 > MAX_SKILL_DEPTH {
        warn!(skill = %skill.name, depth = chain.depth(), "skill depth limit reached");
        return Err(ResolveError::DepthExceeded {
            max: MAX_SKILL_DEPTH,
        });
    }
    Ok(ExecutionFrame {
        skill: skill.name.clone(),
        max_turns: skill.max_turns,
        model: skill.model.clone(),
        allowed_tools: skill.tools.clone(),
    })
}

/// The tools the run on top of `chain` may call.
///
/// Built from the top frame's `allowed_tools`. Declared names are matched
/// against built-ins first, then against skills with or without the
/// `skill_` prefix. `file_write` is re-rooted at `<output>/<skill>`.
/// Names that match nothing are logged and left out. An empty chain gets
/// an empty toolset.
pub fn build_toolset(ctx: &Arc<AgentContext>, chain: &CallChain, scope: &RunScope) -> ToolRegistry {
    let mut toolset = ToolRegistry::new();
    let Some(frame) = chain.current() else {
        return toolset;
    };
    let skills = ctx.skills();

    for declared in &frame.allowed_tools {
        let tool: Arc<dyn Tool> = match declared.as_str() {
            "file_write" => Arc::new(FileWriteTool::new(ctx.sandbox().scoped(&frame.skill))),
            "skill_create" => Arc::new(SkillCreateTool::new(ctx.clone())),
            name => {
                if let Some(builtin) = ctx.tools().get(name) {
                    builtin
                } else if let Some(nested) = skills.get(name) {
                    Arc::new(SkillTool::new(
                        nested,
                        ctx.clone(),
                        chain.clone(),
                        scope.clone(),
                    ))
                } else {
                    warn!(skill = %frame.skill, tool = name, "skill references unknown tool");
                    continue;
                }
            }
        };
        if let Err(dup) = toolset.register(tool) {
            debug!(skill = %frame.skill, error = %dup, "tool declared twice");
        }
    }
    toolset
}
