//! zhi CLI entry point.
//!
//! # Commands
//!
//! - `zhi` interactive REPL
//! - `zhi -c "MESSAGE"` single message, then exit
//! - `zhi skills` list loaded skills and the files that failed to load

mod helpers;
mod repl;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use zhi_agent::tools::BUILTIN_TOOL_NAMES;
use zhi_agent::{AgentContext, AgentContextBuilder, SkillLoader};
use zhi_core::config::{load_config, Config, PermissionMode};
use zhi_core::utils::get_user_skills_path;
use zhi_providers::{is_valid_model, HttpProvider};

use crate::repl::Session;

// ─────────────────────────────────────────────
// CLI definition
// ─────────────────────────────────────────────

/// zhi: terminal AI agent powered by Zhipu GLM
#[derive(Parser)]
#[command(name = "zhi", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Single message (non-interactive). Omit for REPL mode.
    #[arg(short = 'c', long = "command")]
    message: Option<String>,

    /// Start in auto mode (file writes run without confirmation)
    #[arg(long, default_value_t = false)]
    auto: bool,

    /// Model for the top-level conversation
    #[arg(long)]
    model: Option<String>,

    /// Enable debug logging
    #[arg(long, alias = "debug", default_value_t = false)]
    logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List available skills
    Skills,
}

// ─────────────────────────────────────────────
// Entrypoint
// ─────────────────────────────────────────────

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(None);
    let warnings = config.validate();
    init_logging(cli.logs, &config.log_level);
    for warning in warnings {
        warn!("config: {warning}");
    }

    if let Some(Commands::Skills) = cli.command {
        let skills = SkillLoader::new(config.skill_model.clone())
            .with_user_dir(get_user_skills_path())
            .load(&builtin_tool_names());
        helpers::print_skills(&skills);
        return Ok(());
    }

    if let Some(model) = &cli.model {
        if !is_valid_model(model) {
            anyhow::bail!("unknown model '{model}'");
        }
        config.default_model = model.clone();
    }
    if cli.auto {
        config.permission_mode = PermissionMode::Auto;
    }

    let ctx = build_context(&config, cli.logs)?;
    let session = Session::new(
        ctx,
        config.default_model.clone(),
        config.permission_mode,
        config.max_turns,
    );

    match cli.message {
        Some(msg) => run_once(session, &msg).await,
        None => repl::run(session).await,
    }
}

async fn run_once(mut session: Session, message: &str) -> Result<()> {
    info!(model = %session.model, "processing single message");
    let outcome = session
        .send(message)
        .await
        .context("agent processing failed")?;
    repl::report_outcome(outcome, session.max_turns);
    Ok(())
}

/// Build the shared agent context from the loaded configuration.
/// `verbose` also echoes tool results.
fn build_context(config: &Config, verbose: bool) -> Result<Arc<AgentContext>> {
    if !config.has_api_key() {
        anyhow::bail!(
            "API key is not set. Add \"apiKey\" to ~/.zhi/config.json or set ZHI_API_KEY."
        );
    }
    let provider = Arc::new(
        HttpProvider::from_config(config).context("failed to create the API client")?,
    );
    let working_dir = std::env::current_dir().context("failed to read the current directory")?;

    let ctx = AgentContextBuilder::from_config(provider.clone(), config)
        .ocr(provider)
        .working_dir(working_dir)
        .confirm(helpers::confirm)
        .ask(helpers::ask)
        .observer(Arc::new(helpers::TerminalObserver::new(verbose)))
        .build();
    info!(skills = ctx.skills().len(), "agent context ready");
    Ok(ctx)
}

fn builtin_tool_names() -> Vec<String> {
    BUILTIN_TOOL_NAMES.iter().map(|s| s.to_string()).collect()
}

/// Initialize tracing/logging on stderr.
fn init_logging(verbose: bool, level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("zhi=debug,info")
    } else {
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}
