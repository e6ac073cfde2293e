//! Configuration schema.
//!
//! JSON on disk uses camelCase keys; every field has a default so a partial
//! file is always accepted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Zhipu's OpenAI-compatible endpoint.
pub const DEFAULT_API_BASE: &str = "https://open.bigmodel.cn/api/paas/v4";

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

// ─────────────────────────────────────────────
// Permission mode
// ─────────────────────────────────────────────

/// Session-level policy for High-tier tools.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    /// High-tier tools ask before running.
    #[default]
    Approve,
    /// High-tier tools run without asking. Always-tier tools still ask.
    Auto,
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionMode::Approve => write!(f, "approve"),
            PermissionMode::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" => Ok(PermissionMode::Approve),
            "auto" => Ok(PermissionMode::Auto),
            other => Err(format!("unknown permission mode '{other}'")),
        }
    }
}

// ─────────────────────────────────────────────
// Root config
// ─────────────────────────────────────────────

/// Root configuration, loaded from `~/.zhi/config.json` plus env vars.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Zhipu API key.
    pub api_key: String,
    /// Base URL of the chat completions API.
    pub api_base: String,
    /// Model used by the top-level conversation.
    pub default_model: String,
    /// Model used by skills that don't name one.
    pub skill_model: String,
    /// Sandbox root for every file a tool creates.
    pub output_dir: String,
    /// Tool-calling turns allowed per top-level run.
    pub max_turns: u32,
    pub log_level: String,
    pub permission_mode: PermissionMode,
    /// Default shell timeout in seconds.
    pub shell_timeout: u64,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: DEFAULT_API_BASE.to_string(),
            default_model: "glm-5".to_string(),
            skill_model: "glm-4-flash".to_string(),
            output_dir: "zhi-output".to_string(),
            max_turns: 30,
            log_level: "warn".to_string(),
            permission_mode: PermissionMode::Approve,
            shell_timeout: 30,
            max_tokens: 8192,
            temperature: 0.7,
        }
    }
}

impl Config {
    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Check the loaded values, clamping anything out of range.
    ///
    /// Returns one human-readable warning per problem found.
    pub fn validate(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.api_key.is_empty() {
            warnings.push("API key is not set".to_string());
        }
        if !(1..=100).contains(&self.max_turns) {
            warnings.push(format!("maxTurns should be 1-100, got {}", self.max_turns));
            self.max_turns = self.max_turns.clamp(1, 100);
        }
        if !(1..=300).contains(&self.shell_timeout) {
            warnings.push(format!(
                "shellTimeout should be 1-300 seconds, got {}",
                self.shell_timeout
            ));
            self.shell_timeout = self.shell_timeout.clamp(1, 300);
        }
        let level = self.log_level.to_ascii_lowercase();
        let level = if level == "warning" { "warn".to_string() } else { level };
        if VALID_LOG_LEVELS.contains(&level.as_str()) {
            self.log_level = level;
        } else {
            warnings.push(format!("Unknown logLevel '{}', using warn", self.log_level));
            self.log_level = "warn".to_string();
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            warnings.push(format!(
                "temperature should be 0.0-2.0, got {}",
                self.temperature
            ));
            self.temperature = self.temperature.clamp(0.0, 2.0);
        }

        warnings
    }
}
