//! Skill file parsing: flat `*.yaml` files and `SKILL.md` directories.
//!
//! # YAML format
//!
//! ```yaml
//! name: summarize
//! description: Summarize a document
//! system_prompt: You are a careful summarizer...
//! tools: [file_read, file_write]
//! model: glm-4-flash        # optional
//! max_turns: 10             # optional, clamped to 1..=50
//! input:
//!   args:
//!     - {name: file, type: file, required: true}
//! output:
//!   description: A markdown summary
//!   directory: summaries
//! ```
//!
//! # SKILL.md format
//!
//! YAML frontmatter between `---` lines, then a markdown body that becomes
//! the system prompt. `tools` is optional here. Text files next to
//! `SKILL.md` and in its subdirectories are appended as reference material.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::warn;

pub const MAX_SKILL_NAME_LEN: usize = 64;
pub const DEFAULT_SKILL_MAX_TURNS: u32 = 15;
const MAX_SKILL_TURNS: i64 = 50;
pub const DEFAULT_OUTPUT_DIRECTORY: &str = "zhi-output";

/// Cap on appended reference material, in bytes.
const MAX_REFERENCES_SIZE: usize = 100_000;

const KNOWN_FIELDS: &[&str] = &[
    "name",
    "description",
    "system_prompt",
    "tools",
    "model",
    "max_turns",
    "input",
    "output",
    "version",
    "disable-model-invocation",
];

// ─────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────

/// Where a skill was loaded from. User skills override builtin ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SkillSource {
    Builtin,
    User,
}

impl std::fmt::Display for SkillSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkillSource::Builtin => f.write_str("builtin"),
            SkillSource::User => f.write_str("user"),
        }
    }
}

/// One declared skill argument. `type: file` arguments are read and
/// injected into the skill's first message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputArg {
    pub name: String,
    #[serde(rename = "type", default = "default_arg_type")]
    pub arg_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

fn default_arg_type() -> String {
    "string".into()
}

impl InputArg {
    pub fn is_file(&self) -> bool {
        self.arg_type == "file"
    }
}

/// A validated skill. Immutable once loaded.
#[derive(Clone, Debug, PartialEq)]
pub struct SkillDefinition {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    /// Built-in tool names or other skill names (with or without `skill_`).
    pub tools: Vec<String>,
    pub model: String,
    pub max_turns: u32,
    pub input_args: Vec<InputArg>,
    pub output_description: String,
    pub output_directory: String,
    pub version: String,
    pub source: SkillSource,
    pub disable_model_invocation: bool,
    /// File (or label, for embedded skills) the definition came from.
    pub origin: String,
}

impl SkillDefinition {
    /// Minimal definition, mostly for tests and programmatic skills.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        system_prompt: impl Into<String>,
        tools: Vec<String>,
        model: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            origin: format!("inline:{name}"),
            name,
            description: description.into(),
            system_prompt: system_prompt.into(),
            tools,
            model: model.into(),
            max_turns: DEFAULT_SKILL_MAX_TURNS,
            input_args: Vec::new(),
            output_description: String::new(),
            output_directory: DEFAULT_OUTPUT_DIRECTORY.into(),
            version: String::new(),
            source: SkillSource::User,
            disable_model_invocation: false,
        }
    }
}

/// Why a skill file was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SkillError {
    #[error("Cannot read skill file {path}: {message}")]
    Read { path: String, message: String },

    #[error("Skill file is empty: {0}")]
    Empty(String),

    #[error("Skill file appears to be binary: {0}")]
    Binary(String),

    #[error("Malformed YAML in {path}: {message}")]
    Yaml { path: String, message: String },

    #[error("SKILL.md must start with YAML frontmatter (---): {0}")]
    MissingFrontmatter(String),

    #[error("Skill file must contain a YAML mapping: {0}")]
    NotMapping(String),

    #[error("Missing required fields in {path}: {}", .fields.join(", "))]
    MissingFields { path: String, fields: Vec<String> },

    #[error("Invalid skill name: '{0}' (letters, digits, '-' and '_', max 64 chars)")]
    InvalidName(String),

    #[error("'{field}' must be {expected} in {path}")]
    WrongType {
        path: String,
        field: &'static str,
        expected: &'static str,
    },

    #[error("Skill '{skill}' references unknown tool '{tool}'")]
    UnknownTool { skill: String, tool: String },
}

/// `^[A-Za-z0-9][A-Za-z0-9_-]*$`, at most 64 characters.
pub fn validate_skill_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    name.len() <= MAX_SKILL_NAME_LEN
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// ─────────────────────────────────────────────
// YAML skills
// ─────────────────────────────────────────────

pub fn load_skill_yaml(
    path: &Path,
    source: SkillSource,
    default_model: &str,
) -> Result<SkillDefinition, SkillError> {
    let origin = path.display().to_string();
    let raw = std::fs::read(path).map_err(|e| SkillError::Read {
        path: origin.clone(),
        message: e.to_string(),
    })?;
    if raw.is_empty() {
        return Err(SkillError::Empty(origin));
    }
    if raw.contains(&0) {
        return Err(SkillError::Binary(origin));
    }
    let text = String::from_utf8(raw).map_err(|_| SkillError::Binary(origin.clone()))?;
    parse_skill_yaml(&text, &origin, source, default_model)
}

/// Parse a flat YAML skill. `origin` is used in messages only.
pub fn parse_skill_yaml(
    text: &str,
    origin: &str,
    source: SkillSource,
    default_model: &str,
) -> Result<SkillDefinition, SkillError> {
    if text.trim().is_empty() {
        return Err(SkillError::Empty(origin.to_string()));
    }
    let map = parse_mapping(text, origin)?;

    let missing: Vec<String> = ["description", "name", "system_prompt", "tools"]
        .iter()
        .filter(|f| !map.contains_key(**f))
        .map(|f| f.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(SkillError::MissingFields {
            path: origin.to_string(),
            fields: missing,
        });
    }

    let name = skill_name(&map)?;
    let description = string_field(&map, "description", origin)?;
    let system_prompt = string_field(&map, "system_prompt", origin)?;
    let tools = tools_field(&map, origin)?;

    Ok(build_definition(
        &map,
        name,
        description,
        system_prompt,
        tools,
        origin,
        source,
        default_model,
    ))
}

// ─────────────────────────────────────────────
// SKILL.md skills
// ─────────────────────────────────────────────

/// Load `<dir>/SKILL.md` and append reference files found in `<dir>`.
pub fn load_skill_md(
    path: &Path,
    source: SkillSource,
    default_model: &str,
) -> Result<SkillDefinition, SkillError> {
    let origin = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|e| SkillError::Read {
        path: origin.clone(),
        message: e.to_string(),
    })?;
    let mut def = parse_skill_md(&text, &origin, source, default_model)?;

    if let Some(dir) = path.parent() {
        let references = load_references(dir);
        if !references.is_empty() {
            def.system_prompt
                .push_str("\n\n---\n\n## Reference Files\n\n");
            def.system_prompt.push_str(&references);
        }
    }
    Ok(def)
}

/// Parse SKILL.md text (frontmatter + body), without reference files.
pub fn parse_skill_md(
    text: &str,
    origin: &str,
    source: SkillSource,
    default_model: &str,
) -> Result<SkillDefinition, SkillError> {
    if text.trim().is_empty() {
        return Err(SkillError::Empty(origin.to_string()));
    }
    let (frontmatter, body) = split_frontmatter(text)
        .ok_or_else(|| SkillError::MissingFrontmatter(origin.to_string()))?;
    let map = parse_mapping(frontmatter, origin)?;

    let missing: Vec<String> = ["description", "name"]
        .iter()
        .filter(|f| !map.contains_key(**f))
        .map(|f| f.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(SkillError::MissingFields {
            path: origin.to_string(),
            fields: missing,
        });
    }

    let name = skill_name(&map)?;
    let tools = if map.contains_key("tools") {
        tools_field(&map, origin)?
    } else {
        Vec::new()
    };
    let description = string_field(&map, "description", origin)?;

    Ok(build_definition(
        &map,
        name,
        description,
        body.trim().to_string(),
        tools,
        origin,
        source,
        default_model,
    ))
}

/// Split `---\n<yaml>\n---\n<body>`. Returns `None` without frontmatter.
fn split_frontmatter(text: &str) -> Option<(&str, &str)> {
    let rest = text.strip_prefix("---")?;
    let rest = rest.trim_start_matches([' ', '\t', '\r']).strip_prefix('\n')?;

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            return Some((&rest[..offset], &rest[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}

/// Sibling `.md`/`.txt` files, then the same from each subdirectory.
fn load_references(dir: &Path) -> String {
    let mut files = Vec::new();

    let mut entries = sorted_entries(dir);
    for path in &entries {
        if path.is_file() && path.file_name().is_some_and(|n| n != "SKILL.md") {
            files.push((path.clone(), file_label(path, None)));
        }
    }
    entries.retain(|p| p.is_dir());
    for sub in entries {
        let sub_name = sub
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        for path in sorted_entries(&sub) {
            if path.is_file() {
                files.push((path.clone(), file_label(&path, Some(&sub_name))));
            }
        }
    }

    let mut sections = Vec::new();
    let mut total = 0;
    for (path, label) in files {
        let is_text = path
            .extension()
            .is_some_and(|e| e == "md" || e == "txt");
        if !is_text {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(&path) else {
            warn!(path = %path.display(), "cannot read reference file");
            continue;
        };
        if total + content.len() > MAX_REFERENCES_SIZE {
            warn!(
                path = %path.display(),
                limit = MAX_REFERENCES_SIZE,
                "reference files exceed size limit, skipping the rest"
            );
            break;
        }
        total += content.len();
        sections.push(format!("### {label}\n\n{content}"));
    }
    sections.join("\n\n")
}

/// Entries of `dir` sorted by name, hidden ones skipped.
fn sorted_entries(dir: &Path) -> Vec<std::path::PathBuf> {
    let Ok(rd) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<_> = rd
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .is_some_and(|n| !n.to_string_lossy().starts_with('.'))
        })
        .collect();
    paths.sort();
    paths
}

fn file_label(path: &Path, subdir: Option<&str>) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match subdir {
        Some(sub) => format!("{sub}/{name}"),
        None => name,
    }
}

// ─────────────────────────────────────────────
// Field helpers
// ─────────────────────────────────────────────

fn parse_mapping(text: &str, origin: &str) -> Result<Mapping, SkillError> {
    let value: Value = serde_yaml::from_str(text).map_err(|e| SkillError::Yaml {
        path: origin.to_string(),
        message: e.to_string(),
    })?;
    match value {
        Value::Mapping(map) => Ok(map),
        _ => Err(SkillError::NotMapping(origin.to_string())),
    }
}

fn skill_name(map: &Mapping) -> Result<String, SkillError> {
    match map.get("name") {
        Some(Value::String(name)) if validate_skill_name(name) => Ok(name.clone()),
        Some(Value::String(name)) => Err(SkillError::InvalidName(name.clone())),
        Some(other) => Err(SkillError::InvalidName(scalar_to_string(other))),
        None => Err(SkillError::InvalidName(String::new())),
    }
}

fn string_field(map: &Mapping, field: &'static str, origin: &str) -> Result<String, SkillError> {
    match map.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(SkillError::WrongType {
            path: origin.to_string(),
            field,
            expected: "a string",
        }),
    }
}

fn tools_field(map: &Mapping, origin: &str) -> Result<Vec<String>, SkillError> {
    match map.get("tools") {
        Some(Value::Sequence(items)) => Ok(items
            .iter()
            .map(scalar_to_string)
            .filter(|s| !s.is_empty())
            .collect()),
        _ => Err(SkillError::WrongType {
            path: origin.to_string(),
            field: "tools",
            expected: "a list",
        }),
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_definition(
    map: &Mapping,
    name: String,
    description: String,
    system_prompt: String,
    tools: Vec<String>,
    origin: &str,
    source: SkillSource,
    default_model: &str,
) -> SkillDefinition {
    let unknown: Vec<&str> = map
        .keys()
        .filter_map(|k| k.as_str())
        .filter(|k| !KNOWN_FIELDS.contains(k))
        .collect();
    if !unknown.is_empty() {
        warn!(path = origin, fields = ?unknown, "unknown skill fields ignored");
    }

    let input_args = map
        .get("input")
        .and_then(|i| i.get("args"))
        .and_then(|a| a.as_sequence())
        .map(|args| {
            args.iter()
                .filter_map(|a| match serde_yaml::from_value::<InputArg>(a.clone()) {
                    Ok(arg) if !arg.name.is_empty() => Some(arg),
                    _ => {
                        warn!(skill = %name, "skipping input arg without a name");
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let output = map.get("output").and_then(|o| o.as_mapping());
    let output_field = |key: &str| {
        output
            .and_then(|o| o.get(key))
            .and_then(|v| v.as_str())
            .map(String::from)
    };

    let max_turns = map
        .get("max_turns")
        .and_then(|v| v.as_i64())
        .map(|t| t.clamp(1, MAX_SKILL_TURNS) as u32)
        .unwrap_or(DEFAULT_SKILL_MAX_TURNS);

    SkillDefinition {
        model: map
            .get("model")
            .and_then(|m| m.as_str())
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(default_model)
            .to_string(),
        max_turns,
        input_args,
        output_description: output_field("description").unwrap_or_default(),
        output_directory: output_field("directory")
            .unwrap_or_else(|| DEFAULT_OUTPUT_DIRECTORY.to_string()),
        version: map.get("version").map(scalar_to_string).unwrap_or_default(),
        source,
        disable_model_invocation: map
            .get("disable-model-invocation")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        origin: origin.to_string(),
        name,
        description,
        system_prompt,
        tools,
    }
}
