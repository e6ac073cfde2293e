//! Shell tool: run a command in a subprocess.
//!
//! Command vetting happens in the safety gate before `execute` is reached;
//! this tool only runs what it is given, with a timeout and an output cap.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{info, warn};
use zhi_core::utils::truncate_at_char_boundary;

use super::base::{optional_i64, optional_string, require_string, RiskTier, Tool};

/// Output cap in bytes.
const MAX_OUTPUT_SIZE: usize = 100 * 1024;

const MIN_TIMEOUT_SECS: u64 = 1;
const MAX_TIMEOUT_SECS: u64 = 300;

pub struct ShellTool {
    working_dir: Option<PathBuf>,
    default_timeout: u64,
}

impl ShellTool {
    pub fn new(working_dir: Option<PathBuf>, default_timeout: u64) -> Self {
        Self {
            working_dir,
            default_timeout: default_timeout.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS),
        }
    }

    fn timeout_for(&self, params: &HashMap<String, Value>) -> u64 {
        optional_i64(params, "timeout")
            .map(|t| t.clamp(MIN_TIMEOUT_SECS as i64, MAX_TIMEOUT_SECS as i64) as u64)
            .unwrap_or(self.default_timeout)
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command. Every command requires explicit user confirmation. \
         Destructive commands (rm, del, mv, etc.) show extra warnings. \
         Output is capped at 100KB."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute."
                },
                "timeout": {
                    "type": "integer",
                    "description": format!("Timeout in seconds. Default: {}.", self.default_timeout),
                    "default": self.default_timeout
                }
            },
            "required": ["command"]
        })
    }

    fn risk_tier(&self) -> RiskTier {
        RiskTier::Always
    }

    fn shell_command(&self, params: &HashMap<String, Value>) -> Option<String> {
        optional_string(params, "command")
    }

    fn describe_call(&self, params: &HashMap<String, Value>) -> String {
        format!("shell: {}", optional_string(params, "command").unwrap_or_default())
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let command = require_string(&params, "command")?;
        let timeout = self.timeout_for(&params);

        info!(command = %command, timeout_secs = timeout, "executing shell command");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", &command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", &command]);
            c
        };
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        // Dropping the child (timeout or cancellation) kills it.
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Could not execute command")?;

        let output =
            match tokio::time::timeout(Duration::from_secs(timeout), child.wait_with_output()).await
            {
                Ok(result) => result.context("Could not execute command")?,
                Err(_) => {
                    warn!(command = %command, timeout_secs = timeout, "shell command timed out");
                    anyhow::bail!("Command timed out after {timeout}s and was killed.");
                }
            };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        let total = combined.len();
        let mut text = if total > MAX_OUTPUT_SIZE {
            format!(
                "{}\n[truncated, showing first 100KB of {total}B]",
                truncate_at_char_boundary(&combined, MAX_OUTPUT_SIZE)
            )
        } else {
            combined
        };

        match output.status.code() {
            Some(0) => {}
            code => {
                let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                text = format!("[exit code: {code}]\n{text}");
                return Ok(text);
            }
        }

        if text.is_empty() {
            text = "(no output)".into();
        }
        Ok(text)
    }
}
