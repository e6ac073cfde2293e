//! Provider traits.
//!
//! The agent loop only sees [`LlmProvider`]; the `ocr` tool only sees
//! [`OcrBackend`]. [`crate::HttpProvider`] implements both.

use std::path::Path;

use async_trait::async_trait;
use zhi_core::types::{LlmResponse, Message, ToolDefinition};

use crate::error::ProviderError;

/// Per-call generation settings.
#[derive(Clone, Debug)]
pub struct LlmRequestConfig {
    pub max_tokens: u32,
    /// Sampling temperature (0.0 – 2.0).
    pub temperature: f64,
    /// Ask for extended thinking. Ignored for models that don't support it.
    pub thinking: bool,
}

impl Default for LlmRequestConfig {
    fn default() -> Self {
        Self {
            max_tokens: 8192,
            temperature: 0.7,
            thinking: false,
        }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send one chat completion request.
    ///
    /// Transient failures are retried inside the implementation; an `Err`
    /// here is final for this call.
    async fn chat(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        model: &str,
        config: &LlmRequestConfig,
    ) -> Result<LlmResponse, ProviderError>;

    /// Model used when the caller doesn't pick one.
    fn default_model(&self) -> &str;

    fn display_name(&self) -> &str;
}

/// Extracts text from a document or image.
#[async_trait]
pub trait OcrBackend: Send + Sync {
    async fn extract_text(&self, path: &Path) -> Result<String, ProviderError>;
}
