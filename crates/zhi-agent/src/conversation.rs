//! Conversation state owned by the orchestrator.
//!
//! Messages are append-only between resets. Every tool result must answer
//! a tool call issued by an earlier assistant message, exactly once.
//! Call ids come from the model, so ids that repeat an id already issued
//! since the last reset are renamed when the calls are recorded.

use std::collections::HashSet;

use thiserror::Error;
use tracing::debug;
use zhi_core::types::{Message, ToolCall, UsageInfo};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConversationError {
    #[error("tool result for unknown call id '{0}'")]
    UnknownCallId(String),

    #[error("tool call '{0}' already has a result")]
    AlreadyAnswered(String),

    #[error("{0} tool call(s) are still waiting for results")]
    PendingToolCalls(usize),
}

/// Token totals across every provider call in the session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub requests: u64,
}

impl UsageTotals {
    pub fn record(&mut self, usage: &UsageInfo) {
        self.prompt_tokens += u64::from(usage.prompt_tokens);
        self.completion_tokens += u64::from(usage.completion_tokens);
        self.total_tokens += u64::from(usage.total_tokens);
        self.requests += 1;
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConversationState {
    messages: Vec<Message>,
    /// Call ids issued by the assistant that still need a result, in order.
    pending: Vec<String>,
    /// Every call id issued since the last reset.
    issued: HashSet<String>,
    usage: UsageTotals,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(prompt: impl Into<String>) -> Self {
        let mut state = Self::new();
        state.messages.push(Message::system(prompt));
        state
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn usage(&self) -> UsageTotals {
        self.usage
    }

    pub fn record_usage(&mut self, usage: &UsageInfo) {
        self.usage.record(usage);
    }

    /// Append a user message. Rejected while tool calls are unanswered.
    pub fn push_user(&mut self, content: impl Into<String>) -> Result<(), ConversationError> {
        if !self.pending.is_empty() {
            return Err(ConversationError::PendingToolCalls(self.pending.len()));
        }
        self.messages.push(Message::user(content));
        Ok(())
    }

    /// Append a final assistant answer.
    pub fn push_assistant(&mut self, content: impl Into<String>, reasoning: Option<String>) {
        self.messages.push(Message::Assistant {
            content: Some(content.into()),
            tool_calls: None,
            reasoning_content: reasoning,
        });
    }

    /// Append an assistant message that requests tool calls.
    ///
    /// Returns the calls as recorded: an empty id, or one already issued
    /// in this conversation, gets a fresh `<id>_<n>` id. Results must be
    /// pushed against the returned ids.
    pub fn push_tool_calls(
        &mut self,
        content: Option<String>,
        calls: Vec<ToolCall>,
    ) -> Vec<ToolCall> {
        let calls: Vec<ToolCall> = calls
            .into_iter()
            .map(|mut call| {
                if call.id.is_empty() || self.issued.contains(&call.id) {
                    let renamed = self.fresh_id(&call.id);
                    debug!(from = %call.id, to = %renamed, "renamed repeated tool call id");
                    call.id = renamed;
                }
                self.issued.insert(call.id.clone());
                self.pending.push(call.id.clone());
                call
            })
            .collect();
        self.messages.push(Message::assistant_tool_calls(content, calls.clone()));
        calls
    }

    fn fresh_id(&self, id: &str) -> String {
        let base = if id.is_empty() { "call" } else { id };
        (2..)
            .map(|n| format!("{base}_{n}"))
            .find(|candidate| !self.issued.contains(candidate))
            .unwrap_or_else(|| format!("{base}_{}", self.issued.len() + 2))
    }

    /// Append the result for a pending tool call.
    pub fn push_tool_result(
        &mut self,
        call_id: &str,
        content: impl Into<String>,
    ) -> Result<(), ConversationError> {
        let Some(pos) = self.pending.iter().position(|id| id == call_id) else {
            return Err(if self.issued.contains(call_id) {
                ConversationError::AlreadyAnswered(call_id.to_string())
            } else {
                ConversationError::UnknownCallId(call_id.to_string())
            });
        };
        self.pending.remove(pos);
        self.messages.push(Message::tool_result(call_id, content));
        Ok(())
    }

    /// Ids of tool calls still waiting for a result, in issue order.
    pub fn unanswered_calls(&self) -> &[String] {
        &self.pending
    }

    /// Answer every pending call with `note`. Used after an interrupted
    /// turn so the next request is well-formed. Returns how many were closed.
    pub fn close_interrupted(&mut self, note: &str) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        for id in pending {
            self.messages.push(Message::tool_result(id, note));
        }
        count
    }

    /// Clear the conversation, keeping the leading system prompt if any.
    /// Usage totals are kept.
    pub fn reset(&mut self) {
        let system = match self.messages.first() {
            Some(m @ Message::System { .. }) => Some(m.clone()),
            _ => None,
        };
        self.messages.clear();
        self.messages.extend(system);
        self.pending.clear();
        self.issued.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> ToolCall {
        ToolCall::new(id, "file_list", "{}")
    }

    #[test]
    fn test_tool_result_must_match_a_call() {
        let mut state = ConversationState::new();
        state.push_user("list").unwrap();
        assert_eq!(
            state.push_tool_result("ghost", "x"),
            Err(ConversationError::UnknownCallId("ghost".into()))
        );

        state.push_tool_calls(None, vec![call("c1"), call("c2")]);
        state.push_tool_result("c2", "b").unwrap();
        state.push_tool_result("c1", "a").unwrap();
        assert_eq!(
            state.push_tool_result("c1", "again"),
            Err(ConversationError::AlreadyAnswered("c1".into()))
        );
        assert_eq!(state.len(), 4);
    }

    #[test]
    fn test_repeated_call_ids_are_renamed() {
        let mut state = ConversationState::new();
        let first = state.push_tool_calls(None, vec![call("x"), call("x"), call("")]);
        let ids: Vec<&str> = first.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["x", "x_2", "call_2"]);
        for id in &ids {
            state.push_tool_result(id, "ok").unwrap();
        }

        // Same id again on a later turn.
        let second = state.push_tool_calls(None, vec![call("x")]);
        assert_eq!(second[0].id, "x_3");
        assert_eq!(state.unanswered_calls(), ["x_3".to_string()]);
        state.push_tool_result("x_3", "ok").unwrap();

        // The recorded assistant message carries the renamed ids.
        match &state.messages()[4] {
            Message::Assistant { tool_calls: Some(calls), .. } => assert_eq!(calls[0].id, "x_3"),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_user_message_rejected_while_calls_pending() {
        let mut state = ConversationState::new();
        state.push_tool_calls(None, vec![call("c1")]);
        assert_eq!(
            state.push_user("hello?"),
            Err(ConversationError::PendingToolCalls(1))
        );
    }

    #[test]
    fn test_close_interrupted() {
        let mut state = ConversationState::new();
        state.push_tool_calls(None, vec![call("c1"), call("c2")]);
        state.push_tool_result("c1", "done").unwrap();

        assert_eq!(state.close_interrupted("interrupted"), 1);
        assert!(state.unanswered_calls().is_empty());
        assert_eq!(state.messages().last(), Some(&Message::tool_result("c2", "interrupted")));
        state.push_user("continue").unwrap();
    }

    #[test]
    fn test_reset_keeps_system_prompt_and_usage() {
        let mut state = ConversationState::with_system_prompt("You are zhi.");
        state.push_user("hi").unwrap();
        state.push_assistant("hello", None);
        state.record_usage(&UsageInfo {
            prompt_tokens: 3,
            completion_tokens: 2,
            total_tokens: 5,
        });

        state.reset();
        assert_eq!(state.messages(), &[Message::system("You are zhi.")]);
        assert_eq!(state.usage().total_tokens, 5);
        assert_eq!(state.usage().requests, 1);
    }
}
