//! Hooks for watching a run from outside the loop.

/// Progress callbacks fired by [`AgentLoop`](crate::AgentLoop).
///
/// Every method defaults to a no-op. Nested skill runs share the context,
/// so their activity is reported through the same observer.
pub trait RunObserver: Send + Sync {
    /// Reasoning text that came back with a model response.
    fn on_thinking(&self, _text: &str) {}

    /// A model response asked for `total` tool calls.
    fn on_tool_total(&self, _total: usize) {}

    /// An authorized call is about to run.
    fn on_tool_start(&self, _tool: &str, _description: &str) {}

    /// A call finished. `result` is the text the model will see.
    fn on_tool_end(&self, _tool: &str, _result: &str) {}
}
