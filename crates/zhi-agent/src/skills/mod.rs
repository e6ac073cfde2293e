//! Skills: named sub-agents with their own prompt, model, and tool subset.
//!
//! Discovery order (later wins on a name clash):
//!
//! 1. Skills embedded in the binary
//! 2. An optional builtin directory
//! 3. The user directory (`~/.zhi/skills/`)
//!
//! Within a directory, `*.yaml` files load first and `<name>/SKILL.md`
//! directories second. A broken file is skipped and recorded as a
//! [`SkillLoadFailure`]; it never stops the others from loading.

pub mod loader;
pub mod resolver;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

pub use loader::{
    load_skill_md, load_skill_yaml, parse_skill_md, parse_skill_yaml, validate_skill_name,
    InputArg, SkillDefinition, SkillError, SkillSource, MAX_SKILL_NAME_LEN,
};
pub use resolver::{
    build_toolset, resolve, CallChain, ExecutionFrame, ResolveError, MAX_SKILL_DEPTH,
    SKILL_TOOL_PREFIX,
};

const EMBEDDED_SKILLS: &[(&str, &str)] = &[
    ("summarize.yaml", include_str!("../../skills/summarize.yaml")),
    ("research.yaml", include_str!("../../skills/research.yaml")),
];

/// A skill that could not be loaded, and why.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkillLoadFailure {
    pub origin: String,
    pub error: SkillError,
}

// ─────────────────────────────────────────────
// SkillSet
// ─────────────────────────────────────────────

/// The loaded skills, keyed by name.
#[derive(Clone, Debug, Default)]
pub struct SkillSet {
    skills: BTreeMap<String, Arc<SkillDefinition>>,
    failures: Vec<SkillLoadFailure>,
}

impl SkillSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from ready definitions, without reference checks.
    pub fn from_definitions(defs: impl IntoIterator<Item = SkillDefinition>) -> Self {
        let skills = defs
            .into_iter()
            .map(|d| (d.name.clone(), Arc::new(d)))
            .collect();
        Self {
            skills,
            failures: Vec::new(),
        }
    }

    /// Look a skill up by bare name or by its `skill_<name>` tool name.
    pub fn get(&self, name: &str) -> Option<Arc<SkillDefinition>> {
        self.skills
            .get(name)
            .or_else(|| {
                name.strip_prefix(SKILL_TOOL_PREFIX)
                    .and_then(|bare| self.skills.get(bare))
            })
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.skills.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SkillDefinition>> {
        self.skills.values()
    }

    pub fn failures(&self) -> &[SkillLoadFailure] {
        &self.failures
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    fn insert(&mut self, def: SkillDefinition) {
        if let Some(prev) = self.skills.get(&def.name) {
            debug!(skill = %def.name, replaced = %prev.origin, by = %def.origin, "skill overridden");
        }
        self.skills.insert(def.name.clone(), Arc::new(def));
    }

    fn record(&mut self, origin: impl Into<String>, error: SkillError) {
        let origin = origin.into();
        warn!(origin = %origin, error = %error, "skipping skill");
        self.failures.push(SkillLoadFailure { origin, error });
    }

    /// Drop skills that declare tools which are neither built-ins nor
    /// loaded skills. Repeats until stable, since dropping one skill can
    /// orphan another that referenced it.
    fn check_references(&mut self, builtin_tools: &[String]) {
        loop {
            let names: HashSet<&str> = self.skills.keys().map(String::as_str).collect();
            let known = |tool: &str| {
                builtin_tools.iter().any(|b| b == tool)
                    || names.contains(tool)
                    || tool
                        .strip_prefix(SKILL_TOOL_PREFIX)
                        .is_some_and(|bare| names.contains(bare))
            };
            let broken: Vec<(String, String)> = self
                .skills
                .values()
                .filter_map(|s| {
                    s.tools
                        .iter()
                        .find(|t| !known(t))
                        .map(|t| (s.name.clone(), t.clone()))
                })
                .collect();
            if broken.is_empty() {
                return;
            }
            for (skill, tool) in broken {
                if let Some(def) = self.skills.remove(&skill) {
                    self.record(def.origin.clone(), SkillError::UnknownTool { skill, tool });
                }
            }
        }
    }
}

// ─────────────────────────────────────────────
// SkillLoader
// ─────────────────────────────────────────────

/// Where to look for skills and how to fill in defaults.
#[derive(Clone, Debug)]
pub struct SkillLoader {
    default_model: String,
    embedded: bool,
    builtin_dir: Option<PathBuf>,
    user_dir: Option<PathBuf>,
}

impl SkillLoader {
    /// Loader with the embedded skills only. `default_model` is used by
    /// skills that don't name one.
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            default_model: default_model.into(),
            embedded: true,
            builtin_dir: None,
            user_dir: None,
        }
    }

    pub fn with_builtin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.builtin_dir = Some(dir.into());
        self
    }

    pub fn with_user_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.user_dir = Some(dir.into());
        self
    }

    pub fn without_embedded(mut self) -> Self {
        self.embedded = false;
        self
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn user_dir(&self) -> Option<&Path> {
        self.user_dir.as_deref()
    }

    /// Load every source. `builtin_tools` are the tool names skills may
    /// declare besides other skills.
    pub fn load(&self, builtin_tools: &[String]) -> SkillSet {
        let mut set = SkillSet::new();

        if self.embedded {
            for (file, text) in EMBEDDED_SKILLS {
                let origin = format!("builtin:{file}");
                match parse_skill_yaml(text, &origin, SkillSource::Builtin, &self.default_model) {
                    Ok(def) => set.insert(def),
                    Err(e) => set.record(origin, e),
                }
            }
        }
        if let Some(dir) = &self.builtin_dir {
            self.scan_dir(dir, SkillSource::Builtin, &mut set);
        }
        if let Some(dir) = &self.user_dir {
            self.scan_dir(dir, SkillSource::User, &mut set);
        }

        set.check_references(builtin_tools);
        debug!(
            skills = set.len(),
            failures = set.failures.len(),
            "skills loaded"
        );
        set
    }

    fn scan_dir(&self, dir: &Path, source: SkillSource, set: &mut SkillSet) {
        let entries = match std::fs::read_dir(dir) {
            Ok(rd) => {
                let mut paths: Vec<PathBuf> = rd.filter_map(|e| e.ok()).map(|e| e.path()).collect();
                paths.sort();
                paths
            }
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "skill directory not readable");
                return;
            }
        };

        for path in entries.iter().filter(|p| {
            p.is_file() && p.extension().is_some_and(|e| e == "yaml")
        }) {
            match load_skill_yaml(path, source, &self.default_model) {
                Ok(def) => set.insert(def),
                Err(e) => set.record(path.display().to_string(), e),
            }
        }

        for sub in entries.iter().filter(|p| p.is_dir()) {
            let skill_md = sub.join("SKILL.md");
            if !skill_md.is_file() {
                continue;
            }
            match load_skill_md(&skill_md, source, &self.default_model) {
                Ok(def) => set.insert(def),
                Err(e) => set.record(skill_md.display().to_string(), e),
            }
        }
    }
}
