//! Agent loop: the LLM ↔ tool-calling state machine.
//!
//! One [`AgentContext`] is built per process and shared by every run,
//! top-level or nested. A run takes the conversation, the toolset it may
//! use, the permission mode, a turn budget, and a cancellation token:
//!
//! 1. Send the conversation and the toolset's schemas to the provider
//! 2. No tool calls: append the answer and finish with [`RunOutcome::Done`]
//! 3. Otherwise run each call in order through the safety gate and the
//!    tool, appending one tool-result per call id
//! 4. After `max_turns` tool-calling turns, stop with
//!    [`RunOutcome::MaxTurnsExceeded`]
//!
//! Cancellation is checked while waiting on the provider, while a tool
//! runs, and right after the confirmation callback returns. Whatever was
//! appended before that point stays in the conversation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use zhi_core::config::{Config, PermissionMode};
use zhi_core::types::ToolCall;
use zhi_core::utils::{get_user_skills_path, truncate_at_char_boundary};
use zhi_providers::{LlmProvider, LlmRequestConfig, OcrBackend};

use crate::conversation::ConversationState;
use crate::error::{AgentError, ToolFailure};
use crate::observer::RunObserver;
use crate::permission::{ConfirmFn, PermissionController};
use crate::safety::{Authorization, SafetyGate};
use crate::sandbox::OutputSandbox;
use crate::skills::{CallChain, SkillLoader, SkillSet};
use crate::tools::{
    AskFn, AskUserTool, FileListTool, FileReadTool, FileWriteTool, OcrTool, ShellTool,
    SkillCreateTool, SkillTool, Tool, ToolRegistry, WebFetchTool, BUILTIN_TOOL_NAMES,
};

/// Tool results larger than this are cut before they reach the model.
pub const MAX_TOOL_RESULT_SIZE: usize = 50_000;

/// Result recorded for tool calls left open by an interrupted turn.
pub const INTERRUPTED_RESULT: &str = "Interrupted by user before this tool call completed.";

// ─────────────────────────────────────────────
// Run types
// ─────────────────────────────────────────────

/// How a run ended, when it did not fail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Done(String),
    MaxTurnsExceeded,
    Interrupted,
}

/// Per-run settings handed down to nested skill runs.
#[derive(Clone, Debug)]
pub struct RunScope {
    pub mode: PermissionMode,
    pub cancel: CancellationToken,
}

impl RunScope {
    pub fn new(mode: PermissionMode, cancel: CancellationToken) -> Self {
        Self { mode, cancel }
    }
}

// ─────────────────────────────────────────────
// AgentContext
// ─────────────────────────────────────────────

/// Everything a run needs that outlives the run.
pub struct AgentContext {
    provider: Arc<dyn LlmProvider>,
    ocr: Option<Arc<dyn OcrBackend>>,
    /// Process-wide built-ins. `file_write` here writes to the output root.
    tools: ToolRegistry,
    skills: RwLock<Arc<SkillSet>>,
    loader: SkillLoader,
    gate: SafetyGate,
    sandbox: OutputSandbox,
    ask: Option<AskFn>,
    observer: Option<Arc<dyn RunObserver>>,
    request: LlmRequestConfig,
    working_dir: PathBuf,
}

impl AgentContext {
    pub fn builder(provider: Arc<dyn LlmProvider>) -> AgentContextBuilder {
        AgentContextBuilder::new(provider)
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub fn ocr(&self) -> Option<&Arc<dyn OcrBackend>> {
        self.ocr.as_ref()
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Snapshot of the loaded skills.
    pub fn skills(&self) -> Arc<SkillSet> {
        match self.skills.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn skill_loader(&self) -> &SkillLoader {
        &self.loader
    }

    pub fn gate(&self) -> &SafetyGate {
        &self.gate
    }

    pub fn sandbox(&self) -> &OutputSandbox {
        &self.sandbox
    }

    pub fn ask_callback(&self) -> Option<AskFn> {
        self.ask.clone()
    }

    pub fn request_config(&self) -> &LlmRequestConfig {
        &self.request
    }

    pub fn observer(&self) -> Option<&Arc<dyn RunObserver>> {
        self.observer.as_ref()
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Tool names a skill may declare, besides other skills.
    pub fn builtin_tool_names(&self) -> Vec<String> {
        BUILTIN_TOOL_NAMES.iter().map(|s| s.to_string()).collect()
    }

    /// Re-scan the skill directories. Runs already in progress keep the
    /// set they started with.
    pub fn reload_skills(&self) -> Arc<SkillSet> {
        let set = Arc::new(self.loader.load(&self.builtin_tool_names()));
        info!(skills = set.len(), failures = set.failures().len(), "skills reloaded");
        match self.skills.write() {
            Ok(mut guard) => *guard = Arc::clone(&set),
            Err(poisoned) => *poisoned.into_inner() = Arc::clone(&set),
        }
        set
    }

    /// The top-level toolset: every built-in, `skill_create`, and one
    /// `skill_<name>` tool per loaded skill.
    pub fn toolset(self: &Arc<Self>, scope: &RunScope) -> ToolRegistry {
        let mut toolset = self.tools.clone();
        let mut extra: Vec<Arc<dyn Tool>> = vec![Arc::new(SkillCreateTool::new(Arc::clone(self)))];
        for skill in self.skills().iter() {
            extra.push(Arc::new(SkillTool::new(
                Arc::clone(skill),
                Arc::clone(self),
                CallChain::new(),
                scope.clone(),
            )));
        }
        for tool in extra {
            if let Err(dup) = toolset.register(tool) {
                warn!(error = %dup, "skipping tool with a clashing name");
            }
        }
        toolset
    }

    /// Run a skill directly, as `/run` does. The user asked for it, so
    /// there is no confirmation step.
    pub async fn run_skill(
        self: &Arc<Self>,
        name: &str,
        input: &str,
        scope: &RunScope,
    ) -> anyhow::Result<String> {
        let skill = self
            .skills()
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown skill '{name}'"))?;
        let tool = SkillTool::new(skill, Arc::clone(self), CallChain::new(), scope.clone());
        let params = HashMap::from([("input".to_string(), Value::String(input.to_string()))]);
        tool.execute(params).await
    }
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("provider", &self.provider.display_name())
            .field("tools", &self.tools)
            .field("skills", &self.skills().names())
            .field("output", &self.sandbox.root())
            .finish()
    }
}

// ─────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────

pub struct AgentContextBuilder {
    provider: Arc<dyn LlmProvider>,
    ocr: Option<Arc<dyn OcrBackend>>,
    working_dir: PathBuf,
    output_dir: PathBuf,
    shell_timeout: u64,
    confirm: Option<ConfirmFn>,
    ask: Option<AskFn>,
    observer: Option<Arc<dyn RunObserver>>,
    request: LlmRequestConfig,
    loader: SkillLoader,
}

impl AgentContextBuilder {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        let loader = SkillLoader::new(provider.default_model());
        Self {
            provider,
            ocr: None,
            working_dir: PathBuf::from("."),
            output_dir: PathBuf::from("zhi-output"),
            shell_timeout: 30,
            confirm: None,
            ask: None,
            observer: None,
            request: LlmRequestConfig::default(),
            loader,
        }
    }

    /// Settings from the config file: output dir, shell timeout, request
    /// config, and the user skill directory.
    pub fn from_config(provider: Arc<dyn LlmProvider>, config: &Config) -> Self {
        Self::new(provider)
            .output_dir(&config.output_dir)
            .shell_timeout(config.shell_timeout)
            .request(LlmRequestConfig {
                max_tokens: config.max_tokens,
                temperature: config.temperature,
                thinking: false,
            })
            .skill_loader(
                SkillLoader::new(config.skill_model.clone()).with_user_dir(get_user_skills_path()),
            )
    }

    pub fn ocr(mut self, backend: Arc<dyn OcrBackend>) -> Self {
        self.ocr = Some(backend);
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Relative paths are taken from the working directory.
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn shell_timeout(mut self, secs: u64) -> Self {
        self.shell_timeout = secs;
        self
    }

    pub fn confirm<F>(mut self, f: F) -> Self
    where
        F: Fn(&crate::permission::PermissionRequest) -> bool + Send + Sync + 'static,
    {
        self.confirm = Some(Arc::new(f));
        self
    }

    pub fn ask<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &[String]) -> String + Send + Sync + 'static,
    {
        self.ask = Some(Arc::new(f));
        self
    }

    pub fn observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn request(mut self, request: LlmRequestConfig) -> Self {
        self.request = request;
        self
    }

    pub fn skill_loader(mut self, loader: SkillLoader) -> Self {
        self.loader = loader;
        self
    }

    pub fn build(self) -> Arc<AgentContext> {
        let output_dir = if self.output_dir.is_absolute() {
            self.output_dir
        } else {
            self.working_dir.join(self.output_dir)
        };
        let sandbox = OutputSandbox::new(output_dir);

        let mut tools = ToolRegistry::new();
        let mut builtins: Vec<Arc<dyn Tool>> = vec![
            Arc::new(FileReadTool::new(&self.working_dir)),
            Arc::new(FileListTool::new(&self.working_dir)),
            Arc::new(FileWriteTool::new(sandbox.clone())),
            Arc::new(ShellTool::new(Some(self.working_dir.clone()), self.shell_timeout)),
            Arc::new(WebFetchTool::new()),
            Arc::new(AskUserTool::new(self.ask.clone())),
        ];
        if let Some(backend) = &self.ocr {
            builtins.push(Arc::new(OcrTool::new(Arc::clone(backend), &self.working_dir)));
        }
        for tool in builtins {
            if let Err(dup) = tools.register(tool) {
                warn!(error = %dup, "built-in tool registered twice");
            }
        }

        let builtin_names: Vec<String> = BUILTIN_TOOL_NAMES.iter().map(|s| s.to_string()).collect();
        let skills = self.loader.load(&builtin_names);

        info!(
            provider = self.provider.display_name(),
            tools = tools.len(),
            skills = skills.len(),
            output = %sandbox.root().display(),
            "agent context ready"
        );

        Arc::new(AgentContext {
            provider: self.provider,
            ocr: self.ocr,
            tools,
            skills: RwLock::new(Arc::new(skills)),
            loader: self.loader,
            gate: SafetyGate::new(PermissionController::new(self.confirm)),
            sandbox,
            ask: self.ask,
            observer: self.observer,
            request: self.request,
            working_dir: self.working_dir,
        })
    }
}

// ─────────────────────────────────────────────
// AgentLoop
// ─────────────────────────────────────────────

pub struct AgentLoop {
    ctx: Arc<AgentContext>,
    request: LlmRequestConfig,
}

impl AgentLoop {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        let request = ctx.request_config().clone();
        Self { ctx, request }
    }

    /// Override the request config (thinking, temperature) for this loop.
    pub fn with_request(mut self, request: LlmRequestConfig) -> Self {
        self.request = request;
        self
    }

    /// Drive the conversation until the model answers without tool calls,
    /// the turn budget runs out, or `cancel` fires.
    ///
    /// Calls left unanswered by an earlier interrupted run are closed
    /// first, so an interrupted state can be passed straight back in.
    pub async fn run(
        &self,
        state: &mut ConversationState,
        toolset: &ToolRegistry,
        mode: PermissionMode,
        max_turns: u32,
        model: &str,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, AgentError> {
        let closed = state.close_interrupted(INTERRUPTED_RESULT);
        if closed > 0 {
            debug!(closed, "closed tool calls left open by an interrupted run");
        }

        let definitions = toolset.get_definitions();
        let tools = (!definitions.is_empty()).then_some(definitions.as_slice());
        let mut turns: u32 = 0;

        loop {
            if turns >= max_turns {
                warn!(model, max_turns, "turn budget exhausted");
                return Ok(RunOutcome::MaxTurnsExceeded);
            }

            debug!(model, turn = turns, messages = state.len(), "LLM call");
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(model, "run interrupted while waiting for the model");
                    return Ok(RunOutcome::Interrupted);
                }
                response = self.ctx.provider().chat(state.messages(), tools, model, &self.request) => response?,
            };
            if let Some(usage) = &response.usage {
                state.record_usage(usage);
            }
            if let (Some(observer), Some(thinking)) =
                (self.ctx.observer(), response.reasoning_content.as_deref())
            {
                if !thinking.trim().is_empty() {
                    observer.on_thinking(thinking);
                }
            }

            if !response.has_tool_calls() {
                let text = response.content.unwrap_or_default();
                state.push_assistant(text.clone(), response.reasoning_content);
                return Ok(RunOutcome::Done(text));
            }

            let calls = state.push_tool_calls(response.content, response.tool_calls);
            if let Some(observer) = self.ctx.observer() {
                observer.on_tool_total(calls.len());
            }

            for call in &calls {
                match self.dispatch(call, toolset, mode, cancel).await {
                    Some(result) => {
                        if let Err(e) = state.push_tool_result(&call.id, result) {
                            warn!(tool = %call.function.name, error = %e, "tool result not recorded");
                        }
                    }
                    None => {
                        info!(tool = %call.function.name, "run interrupted during tool call");
                        return Ok(RunOutcome::Interrupted);
                    }
                }
            }
            turns += 1;
        }
    }

    /// Authorize and run one call. `None` means the run was cancelled.
    async fn dispatch(
        &self,
        call: &ToolCall,
        toolset: &ToolRegistry,
        mode: PermissionMode,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let name = call.function.name.as_str();
        let Some(tool) = toolset.get(name) else {
            warn!(tool = name, "model called an unknown tool");
            return Some(ToolFailure::UnknownTool(name.to_string()).to_string());
        };

        let params: HashMap<String, Value> = serde_json::from_str(&call.function.arguments)
            .unwrap_or_else(|e| {
                debug!(tool = name, error = %e, "malformed tool arguments, using {{}}");
                HashMap::new()
            });

        if let Authorization::Deny(failure) = self.ctx.gate().authorize(tool.as_ref(), &params, mode)
        {
            info!(tool = name, reason = %failure, "tool call denied");
            return Some(failure.to_string());
        }
        if cancel.is_cancelled() {
            return None;
        }

        info!(tool = name, "executing tool call");
        if let Some(observer) = self.ctx.observer() {
            observer.on_tool_start(name, &tool.describe_call(&params));
        }
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            result = toolset.execute(name, params) => result,
        };

        let text = match result {
            Ok(output) => output,
            Err(failure) => failure.to_string(),
        };
        debug!(tool = name, result_len = text.len(), "tool result");
        let text = cap_result(text);
        if let Some(observer) = self.ctx.observer() {
            observer.on_tool_end(name, &text);
        }
        Some(text)
    }
}

fn cap_result(text: String) -> String {
    if text.len() <= MAX_TOOL_RESULT_SIZE {
        return text;
    }
    format!(
        "{}\n[truncated, showing first 50KB of {} bytes]",
        truncate_at_char_boundary(&text, MAX_TOOL_RESULT_SIZE),
        text.len()
    )
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{call, test_context, ScriptedProvider};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use zhi_core::types::{LlmResponse, Message, UsageInfo};

    async fn run_once(
        ctx: &Arc<AgentContext>,
        state: &mut ConversationState,
        mode: PermissionMode,
        max_turns: u32,
    ) -> RunOutcome {
        let scope = RunScope::new(mode, CancellationToken::new());
        let toolset = ctx.toolset(&scope);
        AgentLoop::new(Arc::clone(ctx))
            .run(state, &toolset, mode, max_turns, "glm-4-flash", &scope.cancel)
            .await
            .unwrap()
    }

    fn tool_results(state: &ConversationState) -> Vec<String> {
        state
            .messages()
            .iter()
            .filter_map(|m| match m {
                Message::Tool { content, .. } => Some(content.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_plain_answer() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![LlmResponse {
            usage: Some(UsageInfo {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            ..LlmResponse::text("Hello!")
        }]);
        let ctx = test_context(provider.clone(), dir.path()).build();

        let mut state = ConversationState::with_system_prompt("sys");
        state.push_user("Hi").unwrap();
        let outcome = run_once(&ctx, &mut state, PermissionMode::Approve, 5).await;

        assert_eq!(outcome, RunOutcome::Done("Hello!".into()));
        assert_eq!(state.len(), 3);
        assert_eq!(state.usage().total_tokens, 15);
        assert_eq!(state.usage().requests, 1);
        assert_eq!(provider.requests(), 1);
    }

    #[tokio::test]
    async fn test_path_traversal_is_rejected_before_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let asked = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&asked);
        let provider = ScriptedProvider::new(vec![
            LlmResponse::with_tool_calls(vec![call(
                "c1",
                "file_write",
                json!({"path": "../../etc/passwd", "content": "x"}),
            )]),
            LlmResponse::text("ok"),
        ]);
        let ctx = test_context(provider, dir.path())
            .confirm(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                true
            })
            .build();

        let mut state = ConversationState::new();
        state.push_user("write it").unwrap();
        let outcome = run_once(&ctx, &mut state, PermissionMode::Approve, 5).await;

        assert_eq!(outcome, RunOutcome::Done("ok".into()));
        assert_eq!(
            tool_results(&state),
            vec!["Error: Path traversal ('..') is not allowed.".to_string()]
        );
        assert_eq!(asked.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join("etc").exists());
    }

    #[tokio::test]
    async fn test_blocked_shell_command_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let asked = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&asked);
        let provider = ScriptedProvider::new(vec![
            LlmResponse::with_tool_calls(vec![call(
                "c1",
                "shell",
                json!({"command": "rm -rf /"}),
            )]),
            LlmResponse::text("I won't do that."),
        ]);
        let ctx = test_context(provider, dir.path())
            .confirm(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                true
            })
            .build();

        let mut state = ConversationState::new();
        state.push_user("clean up").unwrap();
        run_once(&ctx, &mut state, PermissionMode::Auto, 5).await;

        let results = tool_results(&state);
        assert!(results[0].starts_with("Error: Command blocked for safety."));
        assert_eq!(asked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_auto_mode_runs_low_and_high_without_asking() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "some notes").unwrap();
        let asked = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&asked);
        let provider = ScriptedProvider::new(vec![
            LlmResponse::with_tool_calls(vec![
                call("c1", "file_read", json!({"path": "notes.txt"})),
                call("c2", "file_write", json!({"path": "out.md", "content": "# Out"})),
            ]),
            LlmResponse::text("done"),
        ]);
        let ctx = test_context(provider, dir.path())
            .confirm(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                false
            })
            .build();

        let mut state = ConversationState::new();
        state.push_user("copy").unwrap();
        let outcome = run_once(&ctx, &mut state, PermissionMode::Auto, 5).await;

        assert_eq!(outcome, RunOutcome::Done("done".into()));
        let results = tool_results(&state);
        assert_eq!(results[0], "some notes");
        assert!(results[1].starts_with("File written: out.md"));
        assert_eq!(asked.load(Ordering::SeqCst), 0);
        assert!(dir.path().join("out/out.md").is_file());
    }

    #[tokio::test]
    async fn test_max_turns_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let responses = (0..5)
            .map(|i| {
                LlmResponse::with_tool_calls(vec![call(
                    &format!("c{i}"),
                    "file_list",
                    json!({}),
                )])
            })
            .collect();
        let provider = ScriptedProvider::new(responses);
        let ctx = test_context(provider.clone(), dir.path()).build();

        let mut state = ConversationState::new();
        state.push_user("loop").unwrap();
        let outcome = run_once(&ctx, &mut state, PermissionMode::Approve, 3).await;

        assert_eq!(outcome, RunOutcome::MaxTurnsExceeded);
        assert_eq!(provider.requests(), 3);
        assert_eq!(tool_results(&state).len(), 3);
        assert!(state.unanswered_calls().is_empty());
        // user + 3 × (assistant + tool)
        assert_eq!(state.len(), 7);
    }

    #[tokio::test]
    async fn test_unknown_tool_and_malformed_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let mut bad_args = call("c2", "file_read", json!({}));
        bad_args.function.arguments = "{not json".into();
        let provider = ScriptedProvider::new(vec![
            LlmResponse::with_tool_calls(vec![call("c1", "teleport", json!({})), bad_args]),
            LlmResponse::text("sorry"),
        ]);
        let ctx = test_context(provider, dir.path()).build();

        let mut state = ConversationState::new();
        state.push_user("go").unwrap();
        run_once(&ctx, &mut state, PermissionMode::Approve, 5).await;

        assert_eq!(
            tool_results(&state),
            vec![
                "Error: Unknown tool 'teleport'".to_string(),
                "Error executing file_read: Missing required parameter: path".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_denied_call_is_reported_and_loop_continues() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            LlmResponse::with_tool_calls(vec![call(
                "c1",
                "file_write",
                json!({"path": "a.txt", "content": "x"}),
            )]),
            LlmResponse::text("ok, skipped"),
        ]);
        let ctx = test_context(provider, dir.path()).confirm(|_| false).build();

        let mut state = ConversationState::new();
        state.push_user("write").unwrap();
        let outcome = run_once(&ctx, &mut state, PermissionMode::Approve, 5).await;

        assert_eq!(outcome, RunOutcome::Done("ok, skipped".into()));
        assert_eq!(tool_results(&state), vec!["Permission denied by user".to_string()]);
    }

    #[tokio::test]
    async fn test_large_results_are_capped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), "a".repeat(80_000)).unwrap();
        let provider = ScriptedProvider::new(vec![
            LlmResponse::with_tool_calls(vec![call("c1", "file_read", json!({"path": "big.txt"}))]),
            LlmResponse::text("read"),
        ]);
        let ctx = test_context(provider, dir.path()).build();

        let mut state = ConversationState::new();
        state.push_user("read").unwrap();
        run_once(&ctx, &mut state, PermissionMode::Approve, 5).await;

        let result = &tool_results(&state)[0];
        assert!(result.ends_with("\n[truncated, showing first 50KB of 80000 bytes]"));
        assert!(result.len() < 51_000);
    }

    #[tokio::test]
    async fn test_cancel_during_confirmation_then_resume() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let provider = ScriptedProvider::new(vec![
            LlmResponse::with_tool_calls(vec![call(
                "c1",
                "file_write",
                json!({"path": "a.txt", "content": "x"}),
            )]),
            LlmResponse::text("resumed"),
        ]);
        let ctx = test_context(provider, dir.path())
            .confirm(move |_| {
                trigger.cancel();
                true
            })
            .build();

        let scope = RunScope::new(PermissionMode::Approve, cancel.clone());
        let toolset = ctx.toolset(&scope);
        let agent = AgentLoop::new(Arc::clone(&ctx));

        let mut state = ConversationState::new();
        state.push_user("write").unwrap();
        let outcome = agent
            .run(&mut state, &toolset, PermissionMode::Approve, 5, "m", &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Interrupted);
        assert_eq!(state.unanswered_calls(), ["c1".to_string()]);
        assert!(!dir.path().join("out/a.txt").exists());

        let outcome = agent
            .run(&mut state, &toolset, PermissionMode::Approve, 5, "m", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Done("resumed".into()));
        assert_eq!(tool_results(&state), vec![INTERRUPTED_RESULT.to_string()]);
    }

    #[tokio::test]
    async fn test_repeated_call_ids_do_not_end_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            LlmResponse::with_tool_calls(vec![
                call("x", "file_list", json!({})),
                call("x", "file_list", json!({})),
            ]),
            LlmResponse::with_tool_calls(vec![call("x", "file_list", json!({}))]),
            LlmResponse::text("listed"),
        ]);
        let ctx = test_context(provider.clone(), dir.path()).build();

        let mut state = ConversationState::new();
        state.push_user("list twice").unwrap();
        let outcome = run_once(&ctx, &mut state, PermissionMode::Approve, 5).await;

        assert_eq!(outcome, RunOutcome::Done("listed".into()));
        assert!(state.unanswered_calls().is_empty());
        let answered: Vec<String> = state
            .messages()
            .iter()
            .filter_map(|m| match m {
                Message::Tool { tool_call_id, .. } => Some(tool_call_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(answered, ["x", "x_2", "x_3"]);
        assert_eq!(provider.requests(), 3);
    }

    #[derive(Default)]
    struct Recorder {
        events: std::sync::Mutex<Vec<String>>,
    }

    impl RunObserver for Recorder {
        fn on_thinking(&self, text: &str) {
            self.events.lock().unwrap().push(format!("thinking: {text}"));
        }

        fn on_tool_total(&self, total: usize) {
            self.events.lock().unwrap().push(format!("total: {total}"));
        }

        fn on_tool_start(&self, tool: &str, _description: &str) {
            self.events.lock().unwrap().push(format!("start: {tool}"));
        }

        fn on_tool_end(&self, tool: &str, result: &str) {
            self.events.lock().unwrap().push(format!("end: {tool}: {result}"));
        }
    }

    #[tokio::test]
    async fn test_observer_sees_thinking_and_tool_activity() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "some notes").unwrap();
        let provider = ScriptedProvider::new(vec![
            LlmResponse {
                reasoning_content: Some("read the notes first".into()),
                ..LlmResponse::with_tool_calls(vec![
                    call("c1", "file_read", json!({"path": "notes.txt"})),
                    call("c2", "teleport", json!({})),
                ])
            },
            LlmResponse::text("done"),
        ]);
        let recorder = Arc::new(Recorder::default());
        let ctx = test_context(provider, dir.path())
            .observer(recorder.clone())
            .build();

        let mut state = ConversationState::new();
        state.push_user("read").unwrap();
        run_once(&ctx, &mut state, PermissionMode::Approve, 5).await;

        assert_eq!(
            *recorder.events.lock().unwrap(),
            [
                "thinking: read the notes first",
                "total: 2",
                "start: file_read",
                "end: file_read: some notes",
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_while_tool_runs_then_resume() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            LlmResponse::with_tool_calls(vec![
                call("c1", "file_list", json!({})),
                call("c2", "shell", json!({"command": "sleep 5"})),
            ]),
            LlmResponse::text("resumed"),
        ]);
        let ctx = test_context(provider, dir.path()).confirm(|_| true).build();
        let cancel = CancellationToken::new();
        let scope = RunScope::new(PermissionMode::Auto, cancel.clone());
        let toolset = ctx.toolset(&scope);
        let agent = AgentLoop::new(Arc::clone(&ctx));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let mut state = ConversationState::new();
        state.push_user("list then wait").unwrap();
        let started = std::time::Instant::now();
        let outcome = agent
            .run(&mut state, &toolset, PermissionMode::Auto, 5, "m", &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Interrupted);
        assert!(started.elapsed() < std::time::Duration::from_secs(4));
        // user, assistant tool calls, result for c1
        assert_eq!(state.len(), 3);
        assert_eq!(state.unanswered_calls(), ["c2".to_string()]);

        let outcome = agent
            .run(&mut state, &toolset, PermissionMode::Auto, 5, "m", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Done("resumed".into()));
        assert!(state.unanswered_calls().is_empty());
        assert_eq!(
            tool_results(&state).last().map(String::as_str),
            Some(INTERRUPTED_RESULT)
        );
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_model() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::hanging();
        let ctx = test_context(provider, dir.path()).build();
        let cancel = CancellationToken::new();
        let toolset = ToolRegistry::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let mut state = ConversationState::new();
        state.push_user("hello").unwrap();
        let outcome = AgentLoop::new(ctx)
            .run(&mut state, &toolset, PermissionMode::Approve, 5, "m", &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Interrupted);
        assert_eq!(state.len(), 1);
    }

    #[tokio::test]
    async fn test_provider_failure_ends_run() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(ScriptedProvider::new(vec![]), dir.path()).build();
        let mut state = ConversationState::new();
        state.push_user("hi").unwrap();
        let err = AgentLoop::new(ctx)
            .run(
                &mut state,
                &ToolRegistry::new(),
                PermissionMode::Approve,
                5,
                "m",
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Provider(_)));
    }

    #[tokio::test]
    async fn test_toolset_exposes_skills() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(ScriptedProvider::new(vec![]), dir.path())
            .skill_loader(SkillLoader::new("glm-4-flash"))
            .build();
        let scope = RunScope::new(PermissionMode::Approve, CancellationToken::new());
        let names = ctx.toolset(&scope).tool_names();
        for expected in ["file_read", "shell", "skill_create", "skill_summarize", "skill_research"] {
            assert!(names.contains(&expected.to_string()), "{expected} missing from {names:?}");
        }
        assert!(!names.contains(&"ocr".to_string()));
    }
}
