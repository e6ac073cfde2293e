//! `skill_<name>` tools: run a skill as a nested agent loop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use zhi_core::utils::{expand_home, truncate_at_char_boundary};
use zhi_providers::http_provider::validate_ocr_file;
use zhi_providers::models::supports_thinking;

use super::base::{optional_string, Tool};
use crate::agent_loop::{AgentContext, AgentLoop, RunOutcome, RunScope};
use crate::conversation::ConversationState;
use crate::error::ToolFailure;
use crate::skills::{build_toolset, resolve, CallChain, SkillDefinition, SKILL_TOOL_PREFIX};

/// Put in front of every nested system prompt.
pub const LANGUAGE_PREAMBLE: &str = "IMPORTANT: Always respond in the same language as the input document. \
If the document or user input is in Chinese, your ENTIRE output (section headers, table headers, \
column names, labels and other structural elements included) MUST be in Chinese. \
Never mix languages in your response.";

/// Cap on each injected text file, in bytes.
const MAX_INJECTED_FILE: usize = 100 * 1024;

const OCR_EXTENSIONS: &[&str] = &["pdf", "png", "jpg", "jpeg", "gif", "webp"];

pub fn prepend_preamble(system_prompt: &str) -> String {
    format!("{LANGUAGE_PREAMBLE}\n\n{system_prompt}")
}

pub struct SkillTool {
    skill: Arc<SkillDefinition>,
    tool_name: String,
    ctx: Arc<AgentContext>,
    /// Chain of the run this tool belongs to (not including this skill).
    chain: CallChain,
    scope: RunScope,
}

impl SkillTool {
    pub fn new(
        skill: Arc<SkillDefinition>,
        ctx: Arc<AgentContext>,
        chain: CallChain,
        scope: RunScope,
    ) -> Self {
        Self {
            tool_name: format!("{SKILL_TOOL_PREFIX}{}", skill.name),
            skill,
            ctx,
            chain,
            scope,
        }
    }

    pub fn skill(&self) -> &SkillDefinition {
        &self.skill
    }

    fn is_file_arg(&self, key: &str) -> bool {
        self.skill
            .input_args
            .iter()
            .any(|a| a.name == key && a.is_file())
    }

    /// Build the first user message: the input, injected file contents,
    /// and any other arguments as JSON.
    async fn compose_input(&self, params: &HashMap<String, Value>) -> anyhow::Result<String> {
        for arg in self.skill.input_args.iter().filter(|a| a.is_file() && a.required) {
            let provided = optional_string(params, &arg.name).is_some_and(|v| !v.trim().is_empty());
            if !provided {
                anyhow::bail!(
                    "Required file argument '{}' is empty. Please provide the full file path.",
                    arg.name
                );
            }
        }

        let mut message = optional_string(params, "input").unwrap_or_default();
        let mut sections = Vec::new();
        let mut extras = Map::new();

        let mut keys: Vec<&String> = params.keys().filter(|k| *k != "input").collect();
        keys.sort();
        for key in keys {
            let value = &params[key];
            if !self.is_file_arg(key) {
                extras.insert(key.clone(), value.clone());
                continue;
            }
            let Some(path) = value.as_str().filter(|p| !p.trim().is_empty()) else {
                continue;
            };
            let filename = Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string());
            let body = match self.read_attachment(path).await {
                Ok(content) => content,
                Err(e) => format!("[Error: {e:#}]"),
            };
            sections.push(format!("--- File ({key}): {filename} ---\n{body}"));
        }

        if !sections.is_empty() {
            message.push_str("\n\n");
            message.push_str(&sections.join("\n\n"));
        }
        if !extras.is_empty() {
            message.push_str(&format!(
                "\n\nAdditional arguments: {}",
                Value::Object(extras)
            ));
        }
        Ok(message)
    }

    /// Text of a file argument. Images and PDFs go through OCR.
    async fn read_attachment(&self, path: &str) -> anyhow::Result<String> {
        let mut resolved: PathBuf = expand_home(path);
        if resolved.is_relative() {
            resolved = self.ctx.working_dir().join(resolved);
        }
        let ext = resolved
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if OCR_EXTENSIONS.contains(&ext.as_str()) {
            let backend = self
                .ctx
                .ocr()
                .ok_or_else(|| anyhow::anyhow!("OCR is not available for .{ext} files"))?;
            validate_ocr_file(&resolved)?;
            return Ok(backend.extract_text(&resolved).await?);
        }

        if !resolved.is_file() {
            anyhow::bail!("File not found: {path}");
        }
        let raw = tokio::fs::read(&resolved)
            .await
            .with_context(|| format!("Could not read file: {path}"))?;
        if raw.iter().take(8192).any(|b| *b == 0) {
            anyhow::bail!("File appears to be binary: {path}");
        }
        let text = String::from_utf8_lossy(&raw);
        if text.len() > MAX_INJECTED_FILE {
            return Ok(format!(
                "{}\n[truncated, showing first 100KB of {}B]",
                truncate_at_char_boundary(&text, MAX_INJECTED_FILE),
                text.len()
            ));
        }
        Ok(text.into_owned())
    }
}

#[async_trait]
impl Tool for SkillTool {
    fn name(&self) -> &str {
        &self.tool_name
    }

    fn description(&self) -> &str {
        &self.skill.description
    }

    fn parameters(&self) -> Value {
        let mut properties = Map::new();
        properties.insert(
            "input".into(),
            json!({"type": "string", "description": "Instructions or query for the skill"}),
        );
        let mut required = vec![Value::from("input")];
        for arg in &self.skill.input_args {
            let description = if arg.is_file() {
                format!("{} (file path; its content is read for the skill)", arg.description)
                    .trim_start()
                    .to_string()
            } else {
                arg.description.clone()
            };
            properties.insert(
                arg.name.clone(),
                json!({"type": "string", "description": description}),
            );
            if arg.required {
                required.push(Value::from(arg.name.clone()));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required
        })
    }

    fn preflight(&self, _params: &HashMap<String, Value>) -> Result<(), ToolFailure> {
        resolve(&self.skill, &self.chain)?;
        Ok(())
    }

    fn describe_call(&self, params: &HashMap<String, Value>) -> String {
        let input = optional_string(params, "input").unwrap_or_default();
        format!(
            "{} ({})",
            self.tool_name,
            zhi_core::utils::truncate_string(&input, 80)
        )
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let name = &self.skill.name;
        let frame = resolve(&self.skill, &self.chain)?;
        let message = self.compose_input(&params).await?;

        if self.skill.disable_model_invocation {
            let parts: Vec<&str> = [self.skill.system_prompt.as_str(), message.as_str()]
                .into_iter()
                .filter(|p| !p.trim().is_empty())
                .collect();
            return Ok(parts.join("\n\n"));
        }

        let model = frame.model.clone();
        let max_turns = frame.max_turns;
        let child = self.chain.push(frame);
        let toolset = build_toolset(&self.ctx, &child, &self.scope);

        let mut state = ConversationState::with_system_prompt(prepend_preamble(
            &self.skill.system_prompt,
        ));
        state.push_user(message)?;

        let mut request = self.ctx.request_config().clone();
        request.thinking = supports_thinking(&model);

        info!(
            skill = %name,
            depth = child.depth(),
            model = %model,
            tools = ?toolset.tool_names(),
            "running skill"
        );
        let outcome = AgentLoop::new(Arc::clone(&self.ctx))
            .with_request(request)
            .run(
                &mut state,
                &toolset,
                self.scope.mode,
                max_turns,
                &model,
                &self.scope.cancel,
            )
            .await
            .with_context(|| format!("Error running skill '{name}'"))?;

        Ok(match outcome {
            RunOutcome::Done(text) => text,
            RunOutcome::MaxTurnsExceeded => {
                warn!(skill = %name, max_turns, "skill hit its turn budget");
                format!("Skill '{name}' reached max turns without a final response.")
            }
            RunOutcome::Interrupted => format!("Skill '{name}' was interrupted."),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::{InputArg, SkillLoader};
    use crate::testing::{call, test_context, ScriptedProvider};
    use tokio_util::sync::CancellationToken;
    use zhi_core::config::PermissionMode;
    use zhi_core::types::{LlmResponse, Message};

    fn scope() -> RunScope {
        RunScope::new(PermissionMode::Auto, CancellationToken::new())
    }

    fn write_skill(dir: &Path, name: &str, tools: &str) {
        let skills = dir.join("skills");
        std::fs::create_dir_all(&skills).unwrap();
        std::fs::write(
            skills.join(format!("{name}.yaml")),
            format!(
                "name: {name}\ndescription: {name} skill\nsystem_prompt: You are {name}.\n\
                 tools: {tools}\nmodel: glm-4-flash\nmax_turns: 4\n"
            ),
        )
        .unwrap();
    }

    fn user_message(messages: &[Message]) -> String {
        messages
            .iter()
            .find_map(|m| match m {
                Message::User { content } => Some(content.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_skill_cycle_is_blocked() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "a", "[skill_b]");
        write_skill(dir.path(), "b", "[a]");

        // top level → a → b → a (blocked) → b answers → a answers
        let provider = ScriptedProvider::new(vec![
            LlmResponse::with_tool_calls(vec![call("t1", "skill_a", json!({"input": "go"}))]),
            LlmResponse::with_tool_calls(vec![call("a1", "skill_b", json!({"input": "go"}))]),
            LlmResponse::with_tool_calls(vec![call("b1", "skill_a", json!({"input": "again"}))]),
            LlmResponse::text("b gave up"),
            LlmResponse::text("a got: b gave up"),
            LlmResponse::text("all done"),
        ]);
        let ctx = test_context(provider.clone(), dir.path()).build();
        assert_eq!(ctx.skills().len(), 2);

        let scope = scope();
        let toolset = ctx.toolset(&scope);
        let mut state = ConversationState::new();
        state.push_user("start").unwrap();
        let outcome = AgentLoop::new(Arc::clone(&ctx))
            .run(&mut state, &toolset, scope.mode, 5, "glm-5", &scope.cancel)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Done("all done".into()));

        let seen = provider.seen();
        assert_eq!(seen.len(), 6);
        // b's second request carries the recursion error as a tool result.
        let blocked = seen[3]
            .messages
            .iter()
            .find_map(|m| match m {
                Message::Tool { content, .. } => Some(content.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            blocked,
            "Error: Recursion blocked: 'a' already in call chain [a, b]"
        );
        // Nested runs only see their declared tools.
        assert_eq!(seen[1].tools, vec!["skill_b".to_string()]);
        assert_eq!(seen[2].tools, vec!["skill_a".to_string()]);
        assert_eq!(
            seen[1].messages[0],
            Message::system(prepend_preamble("You are a."))
        );
    }

    #[test]
    fn test_depth_limit_reported_as_result() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![]);
        let ctx = test_context(provider, dir.path()).build();
        let skill = Arc::new(SkillDefinition::new("d", "d", "p", vec![], "glm-4-flash"));

        let mut chain = CallChain::new();
        for name in ["a", "b", "c"] {
            let def = SkillDefinition::new(name, "d", "p", vec![], "glm-4-flash");
            chain = chain.push(resolve(&def, &chain).unwrap());
        }
        let tool = SkillTool::new(skill, ctx, chain, scope());
        let failure = tool.preflight(&HashMap::new()).unwrap_err();
        assert_eq!(
            failure.to_string(),
            "Error: Recursion blocked: max depth (3) reached"
        );
    }

    #[tokio::test]
    async fn test_max_turns_and_thinking() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            LlmResponse::with_tool_calls(vec![call("x1", "file_list", json!({}))]),
            LlmResponse::with_tool_calls(vec![call("x2", "file_list", json!({}))]),
        ]);
        let ctx = test_context(provider.clone(), dir.path()).build();
        let mut def = SkillDefinition::new("lister", "d", "p", vec!["file_list".into()], "glm-5");
        def.max_turns = 2;

        let tool = SkillTool::new(Arc::new(def), ctx, CallChain::new(), scope());
        let out = tool
            .execute(HashMap::from([("input".to_string(), json!("list"))]))
            .await
            .unwrap();
        assert_eq!(out, "Skill 'lister' reached max turns without a final response.");
        let seen = provider.seen();
        assert!(seen.iter().all(|r| r.thinking && r.model == "glm-5"));
    }

    #[tokio::test]
    async fn test_file_args_are_injected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report.txt"), "quarterly numbers").unwrap();
        let provider = ScriptedProvider::new(vec![LlmResponse::text("summary")]);
        let ctx = test_context(provider.clone(), dir.path()).build();

        let mut def = SkillDefinition::new("sum", "d", "Summarize.", vec![], "glm-4-flash");
        def.input_args = vec![
            InputArg {
                name: "file".into(),
                arg_type: "file".into(),
                description: String::new(),
                required: true,
            },
            InputArg {
                name: "style".into(),
                arg_type: "string".into(),
                description: String::new(),
                required: false,
            },
        ];
        let tool = SkillTool::new(Arc::new(def), ctx, CallChain::new(), scope());

        let schema = tool.parameters();
        assert_eq!(schema["required"], json!(["input", "file"]));

        let err = tool
            .execute(HashMap::from([("input".to_string(), json!("go"))]))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Required file argument 'file' is empty. Please provide the full file path."
        );
        assert_eq!(provider.requests(), 0);

        let out = tool
            .execute(HashMap::from([
                ("input".to_string(), json!("summarize this")),
                ("file".to_string(), json!("report.txt")),
                ("style".to_string(), json!("brief")),
            ]))
            .await
            .unwrap();
        assert_eq!(out, "summary");
        assert_eq!(
            user_message(&provider.seen()[0].messages),
            "summarize this\n\n--- File (file): report.txt ---\nquarterly numbers\n\n\
             Additional arguments: {\"style\":\"brief\"}"
        );
    }

    #[tokio::test]
    async fn test_disable_model_invocation_skips_provider() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![]);
        let ctx = test_context(provider.clone(), dir.path()).build();
        let mut def = SkillDefinition::new("guide", "d", "Follow these steps.", vec![], "m");
        def.disable_model_invocation = true;

        let tool = SkillTool::new(Arc::new(def), ctx, CallChain::new(), scope());
        let out = tool
            .execute(HashMap::from([("input".to_string(), json!("for release"))]))
            .await
            .unwrap();
        assert_eq!(out, "Follow these steps.\n\nfor release");
        assert_eq!(provider.requests(), 0);
    }

    #[tokio::test]
    async fn test_skill_file_write_is_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            LlmResponse::with_tool_calls(vec![call(
                "w1",
                "file_write",
                json!({"path": "notes.md", "content": "hi"}),
            )]),
            LlmResponse::text("written"),
        ]);
        let ctx = test_context(provider, dir.path()).build();
        let def = SkillDefinition::new("writer", "d", "p", vec!["file_write".into()], "m");

        let out = SkillTool::new(Arc::new(def), ctx, CallChain::new(), scope())
            .execute(HashMap::from([("input".to_string(), json!("write"))]))
            .await
            .unwrap();
        assert_eq!(out, "written");
        assert!(dir.path().join("out/writer/notes.md").is_file());
    }

    #[tokio::test]
    async fn test_run_skill_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![LlmResponse::text("brief")]);
        let ctx = test_context(provider, dir.path())
            .skill_loader(SkillLoader::new("glm-4-flash"))
            .build();
        let out = ctx.run_skill("research", "rust async", &scope()).await.unwrap();
        assert_eq!(out, "brief");
        assert!(ctx.run_skill("nope", "", &scope()).await.is_err());
    }
}
