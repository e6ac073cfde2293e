//! Shared CLI helpers: printing, the banner, and the blocking prompts the
//! agent calls back into.

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicUsize, Ordering};

use colored::Colorize;

use zhi_agent::tools::RiskTier;
use zhi_agent::{PermissionRequest, RunObserver, SkillSet};
use zhi_core::utils::truncate_string;

/// Print an agent response to stdout.
pub fn print_response(response: &str) {
    println!();
    println!("{}", "zhi".cyan().bold());
    if response.is_empty() {
        println!("{}", "(no response)".dimmed());
    } else {
        println!("{response}");
    }
    println!();
}

pub fn print_info(msg: &str) {
    println!("{}", msg.dimmed());
}

pub fn print_warning(msg: &str) {
    eprintln!("{} {}", "!".yellow().bold(), msg.yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red().bold(), msg.red());
}

/// Print the banner shown at REPL start.
pub fn print_banner(model: &str, mode: &str) {
    let version = env!("CARGO_PKG_VERSION");
    println!();
    println!("{}  v{}", "zhi".cyan().bold(), version.dimmed());
    println!("{}", "Terminal AI powered by Zhipu GLM".dimmed());
    println!(
        "{}",
        format!("model: {model} | mode: {mode} | /help for commands").dimmed()
    );
    println!();
}

pub fn print_help() {
    println!(
        "\
Available commands:
  /help                Show this help message
  /auto                Switch to auto mode (skip confirmations for file writes)
  /approve             Switch to approve mode (confirm before risky tools)
  /model <name>        Switch model (glm-5, glm-4-flash, glm-4-air)
  /think               Enable thinking mode
  /fast                Disable thinking mode
  /run <skill> [input] Run a skill
  /skill list          List available skills
  /status              Show current session state
  /reset               Clear conversation history
  /usage               Show token usage
  /exit                Exit zhi

Ctrl-C while the agent works interrupts the current run."
    );
}

/// Print loaded skills and the files that failed to load.
pub fn print_skills(skills: &SkillSet) {
    if skills.is_empty() {
        println!("{}", "No skills loaded.".dimmed());
    }
    for skill in skills.iter() {
        println!(
            "  {:<20} {} {}",
            skill.name.bold(),
            skill.description,
            format!("[{}, {}]", skill.source, skill.model).dimmed()
        );
    }
    if !skills.failures().is_empty() {
        println!();
        println!("  {}", "Failed to load:".yellow().bold());
        for failure in skills.failures() {
            println!("    {} {}", failure.origin.dimmed(), failure.error);
        }
    }
}

/// Print a "thinking" placeholder.
pub fn print_thinking() {
    eprint!("{}", "⠿ thinking...".dimmed());
    let _ = io::stderr().flush();
}

/// Clear the "thinking" placeholder.
pub fn clear_thinking() {
    eprint!("\r{}\r", " ".repeat(40));
    let _ = io::stderr().flush();
}

// ─────────────────────────────────────────────
// Run progress
// ─────────────────────────────────────────────

/// Prints reasoning and tool activity while the agent works.
pub struct TerminalObserver {
    verbose: bool,
    step: AtomicUsize,
    total: AtomicUsize,
}

impl TerminalObserver {
    /// With `verbose`, tool results are echoed too.
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            step: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        }
    }
}

impl RunObserver for TerminalObserver {
    fn on_thinking(&self, text: &str) {
        clear_thinking();
        eprintln!("{}", "Thinking...".dimmed().italic());
        for line in text.lines() {
            eprintln!("  {}", line.dimmed().italic());
        }
    }

    fn on_tool_total(&self, total: usize) {
        self.step.store(0, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
    }

    fn on_tool_start(&self, _tool: &str, description: &str) {
        clear_thinking();
        let step = self.step.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.total.load(Ordering::Relaxed);
        eprintln!(
            "{} {}",
            step_label(step, total).cyan(),
            truncate_string(description, 100).dimmed()
        );
    }

    fn on_tool_end(&self, tool: &str, result: &str) {
        if self.verbose {
            eprintln!(
                "  {} {}",
                format!("{tool}:").green(),
                truncate_string(result, 500).dimmed()
            );
        }
    }
}

fn step_label(step: usize, total: usize) -> String {
    if total > 1 {
        format!("[{step}/{total}]")
    } else {
        "[tool]".to_string()
    }
}

// ─────────────────────────────────────────────
// Prompts (called from inside an agent run)
// ─────────────────────────────────────────────

/// Confirmation callback. Blocks the calling worker thread.
pub fn confirm(req: &PermissionRequest) -> bool {
    tokio::task::block_in_place(|| {
        clear_thinking();
        let tag = match req.tier {
            RiskTier::Always => "run".red().bold(),
            _ => "allow".yellow().bold(),
        };
        eprintln!();
        eprintln!("{} {}", tag, req.description.bold());
        if let Some(warning) = &req.warning {
            eprintln!("  {} {}", "warning:".red().bold(), warning.red());
        }
        eprint!("  Allow? [y/N] ");
        let _ = io::stderr().flush();
        let answer = read_line().unwrap_or_default();
        is_yes(&answer)
    })
}

/// `ask_user` callback. Blocks the calling worker thread.
pub fn ask(question: &str, options: &[String]) -> String {
    tokio::task::block_in_place(|| {
        clear_thinking();
        eprintln!();
        eprintln!("{} {}", "?".cyan().bold(), question.bold());
        for (i, option) in options.iter().enumerate() {
            eprintln!("  {}. {option}", i + 1);
        }
        eprint!("> ");
        let _ = io::stderr().flush();
        let answer = read_line().unwrap_or_default();
        pick_option(&answer, options)
    })
}

fn read_line() -> io::Result<String> {
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line)
}

pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// A number picks from `options` (1-based); anything else is returned as typed.
pub fn pick_option(answer: &str, options: &[String]) -> String {
    let answer = answer.trim();
    answer
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| options.get(i))
        .cloned()
        .unwrap_or_else(|| answer.to_string())
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
