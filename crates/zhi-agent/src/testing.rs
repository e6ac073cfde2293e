//! Shared fixtures for the crate's unit tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use zhi_core::types::{LlmResponse, Message, ToolCall, ToolDefinition};
use zhi_providers::{LlmProvider, LlmRequestConfig, ProviderError};

use crate::agent_loop::{AgentContext, AgentContextBuilder};
use crate::skills::SkillLoader;

/// What the provider was sent on one call.
#[derive(Clone, Debug)]
pub(crate) struct SeenRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<String>,
    pub model: String,
    pub thinking: bool,
}

/// Replays canned responses in order. Runs out with `EmptyResponse`.
pub(crate) struct ScriptedProvider {
    responses: Mutex<VecDeque<LlmResponse>>,
    seen: Mutex<Vec<SeenRequest>>,
    hang: bool,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<LlmResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            seen: Mutex::new(Vec::new()),
            hang: false,
        })
    }

    /// A provider that never answers.
    pub fn hanging() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            seen: Mutex::new(Vec::new()),
            hang: true,
        })
    }

    pub fn requests(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        model: &str,
        config: &LlmRequestConfig,
    ) -> Result<LlmResponse, ProviderError> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.seen.lock().unwrap().push(SeenRequest {
            messages: messages.to_vec(),
            tools: tools
                .unwrap_or_default()
                .iter()
                .map(|t| t.function.name.clone())
                .collect(),
            model: model.to_string(),
            thinking: config.thinking,
        });
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(ProviderError::EmptyResponse)
    }

    fn default_model(&self) -> &str {
        "glm-4-flash"
    }

    fn display_name(&self) -> &str {
        "scripted"
    }
}

pub(crate) fn call(id: &str, name: &str, args: Value) -> ToolCall {
    ToolCall::new(id, name, args.to_string())
}

/// A context rooted at `dir`: output goes to `dir/out`, user skills live
/// in `dir/skills`, and nothing is embedded.
pub(crate) fn test_context(provider: Arc<dyn LlmProvider>, dir: &Path) -> AgentContextBuilder {
    AgentContext::builder(provider)
        .working_dir(dir)
        .output_dir(dir.join("out"))
        .skill_loader(
            SkillLoader::new("glm-4-flash")
                .without_embedded()
                .with_user_dir(dir.join("skills")),
        )
}
