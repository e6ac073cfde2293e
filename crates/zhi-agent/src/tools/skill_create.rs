//! `skill_create`: save a new user skill.
//!
//! Writes `<skills>/<name>/SKILL.md` (the default) or a flat
//! `<skills>/<name>.yaml`, then reloads the skill set so the new skill is
//! available from the next run on. Existing skills are never replaced.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use serde_yaml::{Mapping, Value as YamlValue};
use tracing::info;
use zhi_core::utils::{expand_home, format_size};

use super::base::{optional_i64, optional_string, optional_string_list, require_string, RiskTier, Tool};
use crate::agent_loop::AgentContext;
use crate::skills::{validate_skill_name, InputArg, MAX_SKILL_NAME_LEN, SKILL_TOOL_PREFIX};

const DEFAULT_MAX_TURNS: i64 = 15;

/// References above this total are cut when the skill loads.
const REFERENCES_WARN_SIZE: u64 = 100_000;

pub struct SkillCreateTool {
    ctx: Arc<AgentContext>,
}

impl SkillCreateTool {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    fn skills_dir(&self) -> anyhow::Result<PathBuf> {
        self.ctx
            .skill_loader()
            .user_dir()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow::anyhow!("No user skills directory is configured"))
    }

    /// Built-ins plus every loaded skill, bare and prefixed.
    fn known_tools(&self) -> Vec<String> {
        let mut known = self.ctx.builtin_tool_names();
        for name in self.ctx.skills().names() {
            known.push(format!("{SKILL_TOOL_PREFIX}{name}"));
            known.push(name);
        }
        known
    }

    fn validate(&self, name: &str, tools: &[String]) -> anyhow::Result<()> {
        if name.len() > MAX_SKILL_NAME_LEN {
            anyhow::bail!(
                "Skill name too long ({} chars). Maximum: {MAX_SKILL_NAME_LEN}.",
                name.len()
            );
        }
        if !validate_skill_name(name) {
            anyhow::bail!(
                "Invalid skill name '{name}'. Must start with a letter or digit and contain \
                 only letters, digits, hyphens and underscores."
            );
        }
        if tools.is_empty() {
            anyhow::bail!("'tools' parameter is required (at least one tool).");
        }
        let known = self.known_tools();
        let unknown: Vec<&str> = tools
            .iter()
            .filter(|t| !known.contains(t))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            anyhow::bail!(
                "Unknown tools: {}. Available: {}",
                unknown.join(", "),
                known.join(", ")
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for SkillCreateTool {
    fn name(&self) -> &str {
        "skill_create"
    }

    fn description(&self) -> &str {
        "Create a new skill. Default format is SKILL.md (a directory with markdown \
         instructions and optional reference files). Use format='yaml' for a flat YAML file."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Skill name. Letters, digits, hyphens and underscores (max 64 chars)."
                },
                "description": {
                    "type": "string",
                    "description": "What the skill does."
                },
                "system_prompt": {
                    "type": "string",
                    "description": "Instructions for the skill. Becomes the SKILL.md body or the yaml system_prompt."
                },
                "tools": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Tools the skill may use (built-ins or other skills)."
                },
                "model": {
                    "type": "string",
                    "description": "Model for the skill. Defaults to the configured skill model."
                },
                "max_turns": {
                    "type": "integer",
                    "description": "Maximum tool-calling turns (1-50). Default: 15."
                },
                "format": {
                    "type": "string",
                    "enum": ["skill_md", "yaml"],
                    "description": "'skill_md' (default) or 'yaml'."
                },
                "references": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Files to copy into the skill's references/ directory (skill_md only)."
                },
                "input_args": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": {"type": "string"},
                            "type": {"type": "string"},
                            "description": {"type": "string"},
                            "required": {"type": "boolean"}
                        },
                        "required": ["name"]
                    },
                    "description": "Input arguments. Use type 'file' for file paths."
                },
                "output": {
                    "type": "object",
                    "properties": {
                        "description": {"type": "string"},
                        "directory": {"type": "string"}
                    },
                    "description": "Output description and subdirectory."
                }
            },
            "required": ["name", "description", "system_prompt", "tools"]
        })
    }

    fn risk_tier(&self) -> RiskTier {
        RiskTier::High
    }

    fn describe_call(&self, params: &HashMap<String, Value>) -> String {
        let name = optional_string(params, "name").unwrap_or_default();
        match self.skills_dir() {
            Ok(dir) => format!("skill_create → {}", dir.join(name).display()),
            Err(_) => format!("skill_create → {name}"),
        }
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let name = require_string(&params, "name")?;
        let description = require_string(&params, "description")?;
        let system_prompt = require_string(&params, "system_prompt")?;
        let tools = optional_string_list(&params, "tools").unwrap_or_default();
        self.validate(&name, &tools)?;

        let default_model = self.ctx.skill_loader().default_model().to_string();
        let model = optional_string(&params, "model")
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| default_model.clone());
        let max_turns = optional_i64(&params, "max_turns")
            .unwrap_or(DEFAULT_MAX_TURNS)
            .clamp(1, 50);
        let format = optional_string(&params, "format").unwrap_or_else(|| "skill_md".into());
        let input_args: Vec<InputArg> = match params.get("input_args") {
            None | Some(Value::Null) => Vec::new(),
            Some(v) => serde_json::from_value(v.clone())
                .context("'input_args' must be a list of {name, type, description, required} objects")?,
        };
        let output = output_mapping(params.get("output"));

        let dir = self.skills_dir()?;
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Could not create {}", dir.display()))?;
        let yaml_file = dir.join(format!("{name}.yaml"));
        let md_dir = dir.join(&name);
        if yaml_file.exists() {
            anyhow::bail!(
                "Skill '{name}' already exists at {}. Choose a different name or delete the existing skill first.",
                yaml_file.display()
            );
        }
        if md_dir.join("SKILL.md").exists() {
            anyhow::bail!(
                "Skill '{name}' already exists at {}. Choose a different name or delete the existing skill first.",
                md_dir.display()
            );
        }

        let mut meta = Mapping::new();
        meta.insert("name".into(), name.clone().into());
        meta.insert("description".into(), description.into());

        let result = match format.as_str() {
            "skill_md" => {
                meta.insert("tools".into(), yaml_list(&tools));
                if model != default_model {
                    meta.insert("model".into(), model.into());
                }
                if max_turns != DEFAULT_MAX_TURNS {
                    meta.insert("max_turns".into(), YamlValue::Number(max_turns.into()));
                }
                if !input_args.is_empty() {
                    let mut input = Mapping::new();
                    input.insert("args".into(), serde_yaml::to_value(&input_args)?);
                    meta.insert("input".into(), YamlValue::Mapping(input));
                }
                if let Some(output) = output {
                    meta.insert("output".into(), output);
                }
                let frontmatter = serde_yaml::to_string(&meta)?;
                let content = format!("---\n{}\n---\n\n{system_prompt}\n", frontmatter.trim_end());

                std::fs::create_dir_all(&md_dir)
                    .with_context(|| format!("Could not save skill to {}", md_dir.display()))?;
                write_new(&md_dir.join("SKILL.md"), content.as_bytes())?;

                let references = optional_string_list(&params, "references").unwrap_or_default();
                let mut out = format!("Skill '{name}' created at {}", md_dir.join("SKILL.md").display());
                out.push_str(&copy_references(&md_dir, &references));
                out
            }
            "yaml" => {
                meta.insert("model".into(), model.into());
                meta.insert("system_prompt".into(), system_prompt.into());
                meta.insert("tools".into(), yaml_list(&tools));
                meta.insert("max_turns".into(), YamlValue::Number(max_turns.into()));
                if !input_args.is_empty() {
                    let mut input = Mapping::new();
                    input.insert("args".into(), serde_yaml::to_value(&input_args)?);
                    meta.insert("input".into(), YamlValue::Mapping(input));
                }
                if let Some(output) = output {
                    meta.insert("output".into(), output);
                }
                write_new(&yaml_file, serde_yaml::to_string(&meta)?.as_bytes())?;
                format!("Skill '{name}' created at {}", yaml_file.display())
            }
            other => anyhow::bail!("'format' must be 'skill_md' or 'yaml', got '{other}'."),
        };

        info!(skill = %name, format = %format, "skill created");
        let set = self.ctx.reload_skills();
        if let Some(failure) = set.failures().iter().find(|f| f.origin.contains(name.as_str())) {
            return Ok(format!("{result}\nWarning: the skill did not load: {}", failure.error));
        }
        Ok(result)
    }
}

fn yaml_list(items: &[String]) -> YamlValue {
    YamlValue::Sequence(items.iter().map(|s| YamlValue::from(s.as_str())).collect())
}

/// `output` with empty fields dropped, or `None` if nothing is left.
fn output_mapping(value: Option<&Value>) -> Option<YamlValue> {
    let obj = value?.as_object()?;
    let mut out = Mapping::new();
    for key in ["description", "directory"] {
        if let Some(s) = obj.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
            out.insert(key.into(), s.into());
        }
    }
    (!out.is_empty()).then_some(YamlValue::Mapping(out))
}

fn write_new(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("Could not save skill to {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("Could not save skill to {}", path.display()))?;
    Ok(())
}

/// Copy reference files into `<skill>/references/`. Returns the suffix
/// for the tool result.
fn copy_references(skill_dir: &Path, references: &[String]) -> String {
    let mut copied = Vec::new();
    let mut skipped = Vec::new();
    let refs_dir = skill_dir.join("references");

    for reference in references {
        let src = expand_home(reference);
        let file_name = src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| reference.clone());
        if !src.is_file() {
            skipped.push(format!("{file_name} (not found)"));
            continue;
        }
        let copied_ok = std::fs::create_dir_all(&refs_dir)
            .and_then(|_| std::fs::copy(&src, refs_dir.join(&file_name)));
        match copied_ok {
            Ok(_) => copied.push(file_name),
            Err(_) => skipped.push(format!("{file_name} (read error)")),
        }
    }

    let mut out = String::new();
    if !copied.is_empty() {
        out.push_str(&format!(" (references: {})", copied.join(", ")));
        let total: u64 = std::fs::read_dir(&refs_dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .filter_map(|e| e.metadata().ok())
                    .filter(|m| m.is_file())
                    .map(|m| m.len())
                    .sum()
            })
            .unwrap_or(0);
        if total > REFERENCES_WARN_SIZE {
            out.push_str(&format!(
                "\nWarning: Total reference size ({}) exceeds the 100KB limit. References will be truncated at load time.",
                format_size(total)
            ));
        }
    }
    if !skipped.is_empty() {
        out.push_str(&format!(
            "\nNote: {} reference file(s) skipped: {}",
            skipped.len(),
            skipped.join(", ")
        ));
    }
    out
}
