//! LLM provider layer for zhi.
//!
//! # Architecture
//!
//! - [`traits::LlmProvider`]: chat completion abstraction the agent loop talks to
//! - [`traits::OcrBackend`]: text extraction used by the `ocr` tool
//! - [`http_provider::HttpProvider`]: Zhipu (OpenAI-compatible) HTTP client with retry
//! - [`models`]: static catalog of known GLM models

pub mod error;
pub mod http_provider;
pub mod models;
pub mod traits;

pub use error::ProviderError;
pub use http_provider::HttpProvider;
pub use models::{get_model, is_valid_model, list_models, ModelInfo, ModelTier};
pub use traits::{LlmProvider, LlmRequestConfig, OcrBackend};
