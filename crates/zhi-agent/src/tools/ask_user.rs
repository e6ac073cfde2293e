//! `ask_user`: let the model put a question to the person at the terminal.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::base::{optional_string_list, require_string, Tool};

/// `(question, options) -> answer`, supplied by the UI. Blocking.
pub type AskFn = Arc<dyn Fn(&str, &[String]) -> String + Send + Sync>;

pub struct AskUserTool {
    ask: Option<AskFn>,
}

impl AskUserTool {
    pub fn new(ask: Option<AskFn>) -> Self {
        Self { ask }
    }
}

#[async_trait]
impl Tool for AskUserTool {
    fn name(&self) -> &str {
        "ask_user"
    }

    fn description(&self) -> &str {
        "Ask the user a question and wait for their response. \
         Use this to gather missing information, clarify requirements, \
         or let the user choose between options."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The question to ask the user"
                },
                "options": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Optional list of choices for the user to pick from"
                }
            },
            "required": ["question"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let question = require_string(&params, "question")?;
        let options = optional_string_list(&params, "options").unwrap_or_default();
        let Some(ask) = &self.ask else {
            anyhow::bail!("ask_user is not available in this context (no UI callback)");
        };

        let answer = ask(&question, &options);
        if answer.trim().is_empty() {
            return Ok("(no response)".into());
        }
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ask_user_roundtrip() {
        let ask: AskFn = Arc::new(|q: &str, opts: &[String]| format!("{q} -> {}", opts.join("|")));
        let tool = AskUserTool::new(Some(ask));

        let mut params = HashMap::new();
        params.insert("question".into(), json!("Format?"));
        params.insert("options".into(), json!(["md", "csv"]));
        assert_eq!(tool.execute(params).await.unwrap(), "Format? -> md|csv");
    }

    #[tokio::test]
    async fn test_ask_user_without_ui() {
        let tool = AskUserTool::new(None);
        let mut params = HashMap::new();
        params.insert("question".into(), json!("Continue?"));
        assert!(tool.execute(params.clone()).await.is_err());

        let silent: AskFn = Arc::new(|_: &str, _: &[String]| String::new());
        let tool = AskUserTool::new(Some(silent));
        assert_eq!(tool.execute(params).await.unwrap(), "(no response)");
    }
}
