//! Interactive REPL.
//!
//! Uses `rustyline` for line editing with persistent history. Slash
//! commands change session settings; anything else is sent to the agent.

use std::sync::Arc;

use anyhow::Result;
use rustyline::config::Configurer;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{DefaultEditor, Editor};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use zhi_agent::agent_loop::INTERRUPTED_RESULT;
use zhi_agent::{AgentContext, AgentLoop, ConversationState, RunOutcome, RunScope};
use zhi_core::config::PermissionMode;
use zhi_core::utils::get_history_path;
use zhi_providers::models::supports_thinking;
use zhi_providers::{is_valid_model, list_models};

use crate::helpers;

/// Exit commands (case-insensitive match).
const EXIT_COMMANDS: &[&str] = &["exit", "quit", "/exit", "/quit", ":q"];

// ─────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────

/// Settings and history for one interactive session.
pub struct Session {
    pub ctx: Arc<AgentContext>,
    pub state: ConversationState,
    pub model: String,
    pub mode: PermissionMode,
    pub thinking: bool,
    pub max_turns: u32,
}

impl Session {
    pub fn new(ctx: Arc<AgentContext>, model: String, mode: PermissionMode, max_turns: u32) -> Self {
        let thinking = supports_thinking(&model);
        Self {
            ctx,
            state: ConversationState::new(),
            model,
            mode,
            thinking,
            max_turns,
        }
    }

    /// Send one user message and run the agent until it answers.
    pub async fn send(&mut self, text: &str) -> Result<RunOutcome> {
        let closed = self.state.close_interrupted(INTERRUPTED_RESULT);
        if closed > 0 {
            debug!(closed, "closed tool calls from the interrupted turn");
        }
        self.state.push_user(text)?;

        let cancel = CancellationToken::new();
        let watcher = spawn_interrupt_watcher(cancel.clone());
        let scope = RunScope::new(self.mode, cancel.clone());
        let toolset = self.ctx.toolset(&scope);

        let mut request = self.ctx.request_config().clone();
        request.thinking = self.thinking && supports_thinking(&self.model);

        let outcome = AgentLoop::new(Arc::clone(&self.ctx))
            .with_request(request)
            .run(
                &mut self.state,
                &toolset,
                self.mode,
                self.max_turns,
                &self.model,
                &cancel,
            )
            .await;
        watcher.abort();
        Ok(outcome?)
    }

    /// `/run <skill> [input]`.
    pub async fn run_skill(&self, name: &str, input: &str) -> Result<String> {
        let cancel = CancellationToken::new();
        let watcher = spawn_interrupt_watcher(cancel.clone());
        let scope = RunScope::new(self.mode, cancel);
        let result = self.ctx.run_skill(name, input, &scope).await;
        watcher.abort();
        result
    }
}

/// Cancel `token` on Ctrl-C.
fn spawn_interrupt_watcher(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    })
}

pub fn report_outcome(outcome: RunOutcome, max_turns: u32) {
    match outcome {
        RunOutcome::Done(text) => helpers::print_response(&text),
        RunOutcome::MaxTurnsExceeded => helpers::print_warning(&format!(
            "Stopped after {max_turns} tool turns without a final answer."
        )),
        RunOutcome::Interrupted => helpers::print_warning("Interrupted"),
    }
}

// ─────────────────────────────────────────────
// Slash commands
// ─────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Help,
    Auto,
    Approve,
    Model(Option<String>),
    Think,
    Fast,
    Run { skill: String, input: String },
    RunUsage,
    SkillList,
    Reset,
    Usage,
    Status,
    Exit,
    Unknown(String),
}

/// Parse a line starting with `/`. Returns `None` for chat input.
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if is_exit_command(line) {
        return Some(Command::Exit);
    }
    let rest = line.strip_prefix('/')?;
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((h, a)) => (h, a.trim()),
        None => (rest, ""),
    };
    let cmd = match head.to_lowercase().as_str() {
        "help" => Command::Help,
        "auto" => Command::Auto,
        "approve" => Command::Approve,
        "model" => Command::Model((!args.is_empty()).then(|| args.to_string())),
        "think" => Command::Think,
        "fast" => Command::Fast,
        "run" => match args.split_once(char::is_whitespace) {
            _ if args.is_empty() => Command::RunUsage,
            Some((skill, input)) => Command::Run {
                skill: skill.to_string(),
                input: input.trim().to_string(),
            },
            None => Command::Run {
                skill: args.to_string(),
                input: String::new(),
            },
        },
        "skill" | "skills" if args.is_empty() || args == "list" => Command::SkillList,
        "reset" | "clear" => Command::Reset,
        "usage" => Command::Usage,
        "status" => Command::Status,
        _ => Command::Unknown(format!("/{head}")),
    };
    Some(cmd)
}

/// Apply a command. Returns `false` when the REPL should exit.
async fn handle_command(session: &mut Session, cmd: Command) -> bool {
    let available = || {
        list_models()
            .iter()
            .map(|m| m.name)
            .collect::<Vec<_>>()
            .join(", ")
    };
    match cmd {
        Command::Help => helpers::print_help(),
        Command::Auto => {
            session.mode = PermissionMode::Auto;
            helpers::print_info("Mode switched to auto");
        }
        Command::Approve => {
            session.mode = PermissionMode::Approve;
            helpers::print_info("Mode switched to approve");
        }
        Command::Model(None) => helpers::print_info(&format!(
            "Current model: {}. Available: {}",
            session.model,
            available()
        )),
        Command::Model(Some(name)) => {
            if is_valid_model(&name) {
                helpers::print_info(&format!("Model switched to {name}"));
                session.model = name;
            } else {
                helpers::print_warning(&format!(
                    "Unknown model: {name}. Available: {}",
                    available()
                ));
            }
        }
        Command::Think => {
            session.thinking = true;
            if supports_thinking(&session.model) {
                helpers::print_info("Thinking mode enabled");
            } else {
                helpers::print_warning(&format!(
                    "Thinking mode enabled, but {} does not support it",
                    session.model
                ));
            }
        }
        Command::Fast => {
            session.thinking = false;
            helpers::print_info("Thinking mode disabled");
        }
        Command::RunUsage => helpers::print_info("Usage: /run <skill> [input]"),
        Command::Run { skill, input } => {
            let skills = session.ctx.skills();
            if !skills.contains(&skill) {
                helpers::print_warning(&format!(
                    "Unknown skill '{skill}'. Available: {}",
                    skills.names().join(", ")
                ));
                return true;
            }
            helpers::print_thinking();
            let result = session.run_skill(&skill, &input).await;
            helpers::clear_thinking();
            match result {
                Ok(text) => helpers::print_response(&text),
                Err(e) => helpers::print_error(&format!("{e:#}")),
            }
        }
        Command::SkillList => helpers::print_skills(&session.ctx.skills()),
        Command::Reset => {
            session.state.reset();
            helpers::print_info("Conversation cleared");
        }
        Command::Usage => {
            let usage = session.state.usage();
            helpers::print_info(&format!(
                "Requests: {} | prompt tokens: {} | completion tokens: {} | total: {}",
                usage.requests, usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
            ));
        }
        Command::Status => {
            helpers::print_info(&format!(
                "Model: {} | mode: {} | thinking: {} | messages: {} | skills: {} | output: {}",
                session.model,
                session.mode,
                if session.thinking { "on" } else { "off" },
                session.state.len(),
                session.ctx.skills().len(),
                session.ctx.sandbox().root().display()
            ));
        }
        Command::Exit => return false,
        Command::Unknown(name) => helpers::print_warning(&format!(
            "Unknown command: {name}. Type /help for available commands."
        )),
    }
    true
}

// ─────────────────────────────────────────────
// Loop
// ─────────────────────────────────────────────

/// Run the interactive REPL loop.
pub async fn run(mut session: Session) -> Result<()> {
    helpers::print_banner(&session.model, &session.mode.to_string());
    let mut editor = create_editor()?;

    loop {
        let input = match editor.readline("You: ") {
            Ok(line) => line,
            // Ctrl-C at the prompt clears the line; Ctrl-D exits.
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                helpers::print_error(&format!("Input error: {e}"));
                break;
            }
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(trimmed);

        if let Some(cmd) = parse_command(trimmed) {
            if !handle_command(&mut session, cmd).await {
                break;
            }
            continue;
        }

        debug!(input_len = trimmed.len(), "processing input");
        helpers::print_thinking();
        let result = session.send(trimmed).await;
        helpers::clear_thinking();
        match result {
            Ok(outcome) => report_outcome(outcome, session.max_turns),
            Err(e) => helpers::print_error(&format!("{e:#}")),
        }
    }

    println!("\nGoodbye!");
    save_history(&mut editor);
    Ok(())
}

fn create_editor() -> Result<Editor<(), DefaultHistory>> {
    let mut editor = DefaultEditor::new()?;
    editor.set_max_history_size(1000)?;

    let history_path = get_history_path();
    if history_path.exists() {
        let _ = editor.load_history(&history_path);
        debug!("loaded REPL history from {}", history_path.display());
    }
    Ok(editor)
}

fn save_history(editor: &mut Editor<(), DefaultHistory>) {
    let path = get_history_path();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = editor.save_history(&path) {
        debug!("failed to save history: {e}");
    }
}

fn is_exit_command(input: &str) -> bool {
    let lower = input.to_lowercase();
    EXIT_COMMANDS.contains(&lower.as_str())
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
