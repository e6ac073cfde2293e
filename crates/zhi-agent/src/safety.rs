//! Safety gate: decides whether a requested tool call may run.
//!
//! | Tier   | approve | auto    |
//! |--------|---------|---------|
//! | Low    | allow   | allow   |
//! | High   | confirm | allow   |
//! | Always | confirm | confirm |
//!
//! Shell-class tools are always `Always` and their command goes through
//! [`ShellClassifier`] first: blocklisted commands are rejected without
//! asking, destructive ones are confirmed with an extra warning.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};
use zhi_core::config::PermissionMode;

use crate::error::ToolFailure;
use crate::permission::{PermissionController, PermissionRequest};
use crate::tools::{RiskTier, Tool};

/// Commands rejected outright, matched against the normalized command.
const BLOCKED_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf ~",
    "rm -rf /*",
    "rm -rf ~/",
    "mkfs /dev/",
    ":(){ :|:& };:",
    "dd if=/dev/zero of=/dev/",
    "dd if=/dev/random of=/dev/",
    "del /s /q c:\\",
    "rd /s /q c:\\",
    "format c:",
    "format d:",
];

/// Shell wrappers and one-liners that would hide the real command.
const BYPASS_PATTERN: &str = r"\beval\b|\b(?:ba)?sh\s+-c\b|\b(?:z|da|fi|k|c|tc)sh\s+-c\b|\bperl\s+-e\b|\bpython[0-9]*\s+-c\b|\bruby\s+-e\b|\bnode\s+-e\b|/bin/rm\b|/usr/bin/rm\b";

/// Commands confirmed with an extra warning. Each must start a word.
const DESTRUCTIVE_PATTERNS: &[&str] = &[
    "rm ", "rm\t", "del ", "del\t", "rmdir ", "rmdir\t", "mv ", "mv\t", "chmod ", "chmod\t",
    "chown ", "chown\t", "mkfs ", "mkfs\t", "dd ", "dd\t", "shred ", "shred\t", "truncate ",
    "truncate\t", "sed -i", "git reset --hard", "git clean", "del /", "del \\", "rd /", "rd \\",
    "reg delete", "icacls ",
];

const DESTRUCTIVE_WARNING: &str =
    "This command can delete or modify files and cannot be undone.";

// ─────────────────────────────────────────────
// Shell classifier
// ─────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandClass {
    /// Never runs. Carries the reason shown to the model.
    Blocked(String),
    Destructive,
    Normal,
}

pub struct ShellClassifier {
    bypass: Option<Regex>,
}

impl Default for ShellClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellClassifier {
    pub fn new() -> Self {
        Self {
            bypass: Regex::new(BYPASS_PATTERN).ok(),
        }
    }

    /// Lower-case, trim, and collapse runs of whitespace to one space.
    pub fn normalize(command: &str) -> String {
        command
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn classify(&self, command: &str) -> CommandClass {
        let normalized = Self::normalize(command);

        if let Some(pattern) = BLOCKED_PATTERNS.iter().find(|p| normalized.contains(*p)) {
            return CommandClass::Blocked(format!("Pattern '{pattern}' is not allowed."));
        }
        if self.bypass.as_ref().is_some_and(|re| re.is_match(&normalized)) {
            return CommandClass::Blocked("Indirect execution patterns are not allowed.".into());
        }
        // Normalization turned tabs into spaces, so the raw lower-cased
        // command is checked too for the tab variants.
        let raw = command.to_lowercase();
        if DESTRUCTIVE_PATTERNS
            .iter()
            .any(|p| contains_at_word_start(&normalized, p) || contains_at_word_start(&raw, p))
        {
            return CommandClass::Destructive;
        }
        CommandClass::Normal
    }
}

/// `pattern` occurs in `haystack` at the start of a word (so `perform x`
/// does not match `rm `).
fn contains_at_word_start(haystack: &str, pattern: &str) -> bool {
    haystack.match_indices(pattern).any(|(idx, _)| {
        haystack[..idx]
            .chars()
            .next_back()
            .map_or(true, |c| !(c.is_alphanumeric() || c == '_' || c == '-'))
    })
}

// ─────────────────────────────────────────────
// Gate
// ─────────────────────────────────────────────

#[derive(Debug)]
pub enum Authorization {
    Allow,
    Deny(ToolFailure),
}

impl Authorization {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Authorization::Allow)
    }
}

pub struct SafetyGate {
    permissions: PermissionController,
    classifier: ShellClassifier,
}

impl SafetyGate {
    pub fn new(permissions: PermissionController) -> Self {
        Self {
            permissions,
            classifier: ShellClassifier::new(),
        }
    }

    /// Decide whether `tool` may run with `params` under `mode`.
    ///
    /// Order: tool preflight, shell classification, then the tier table.
    /// The confirm callback is only reached when the table says so.
    pub fn authorize(
        &self,
        tool: &dyn Tool,
        params: &HashMap<String, Value>,
        mode: PermissionMode,
    ) -> Authorization {
        if let Err(failure) = tool.preflight(params) {
            debug!(tool = tool.name(), error = %failure, "preflight rejected call");
            return Authorization::Deny(failure);
        }

        let mut tier = tool.risk_tier();
        let mut warning = None;

        if let Some(command) = tool.shell_command(params) {
            tier = RiskTier::Always;
            match self.classifier.classify(&command) {
                CommandClass::Blocked(reason) => {
                    warn!(tool = tool.name(), command = %command, "command blocked");
                    return Authorization::Deny(ToolFailure::CommandBlocked(reason));
                }
                CommandClass::Destructive => warning = Some(DESTRUCTIVE_WARNING.to_string()),
                CommandClass::Normal => {}
            }
        }

        if !tier.requires_confirmation(mode) {
            return Authorization::Allow;
        }

        let request = PermissionRequest {
            tool: tool.name().to_string(),
            description: tool.describe_call(params),
            tier,
            warning,
        };
        if self.permissions.request(&request).granted {
            Authorization::Allow
        } else {
            Authorization::Deny(ToolFailure::PermissionDenied)
        }
    }
}
