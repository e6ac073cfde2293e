//! HTTP provider for Zhipu's OpenAI-compatible API.
//!
//! Talks to `/chat/completions` for chat and to the `/files` endpoints for
//! OCR. Rate limits, 5xx responses, timeouts and connection failures are
//! retried with exponential backoff; everything else fails immediately.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use zhi_core::config::Config;
use zhi_core::types::{
    ChatCompletionRequest, ChatCompletionResponse, LlmResponse, Message, ThinkingConfig,
    ToolDefinition,
};

use crate::error::ProviderError;
use crate::models;
use crate::traits::{LlmProvider, LlmRequestConfig, OcrBackend};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Largest file accepted for OCR.
pub const MAX_OCR_FILE_SIZE: u64 = 20 * 1024 * 1024;
/// File extensions accepted for OCR, lower-case and without the dot.
pub const OCR_EXTENSIONS: &[&str] = &["gif", "jpeg", "jpg", "pdf", "png", "webp"];

// ─────────────────────────────────────────────
// HttpProvider
// ─────────────────────────────────────────────

pub struct HttpProvider {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    default_model: String,
    max_retries: u32,
    retry_base: Duration,
}

impl std::fmt::Debug for HttpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProvider")
            .field("api_base", &self.api_base)
            .field("default_model", &self.default_model)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl HttpProvider {
    pub fn new(api_key: &str, api_base: &str, model: &str) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(HttpProvider {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            default_model: model.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base: DEFAULT_RETRY_BASE,
        })
    }

    /// Build from the loaded configuration.
    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        debug!(api_base = %config.api_base, model = %config.default_model, "Creating LLM provider");
        Self::new(&config.api_key, &config.api_base, &config.default_model)
    }

    /// Override the retry policy (attempts after the first, and base delay).
    pub fn with_retry(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base = base_delay;
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.retry_base.saturating_mul(factor).min(MAX_RETRY_DELAY)
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.backoff_delay(attempt);
                    attempt += 1;
                    info!(
                        attempt,
                        max = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying {}", what
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_chat(&self, body: &ChatCompletionRequest) -> Result<LlmResponse, ProviderError> {
        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        let response = check_status(response).await?;

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        parsed.into_response().ok_or(ProviderError::EmptyResponse)
    }

    async fn upload_for_extraction(&self, path: &Path) -> Result<String, ProviderError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ProviderError::OcrInput(format!("Cannot read {}: {}", path.display(), e)))?;

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/octet-stream")?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("purpose", "file-extract");

        let response = self
            .client
            .post(format!("{}/files", self.api_base))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        let response = check_status(response).await?;

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        json["id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ProviderError::Decode("upload response has no file id".to_string()))
    }

    async fn fetch_extracted(&self, file_id: &str) -> Result<String, ProviderError> {
        let response = self
            .client
            .get(format!("{}/files/{}/content", self.api_base, file_id))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let response = check_status(response).await?;
        let body = response.text().await?;

        // The endpoint answers with `{"content": "..."}`; fall back to the raw body.
        Ok(serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v["content"].as_str().map(String::from))
            .unwrap_or(body))
    }
}

/// Turn a non-success response into a typed error.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error body".to_string());
    error!(status = %status, body = %body, "API error");
    Err(ProviderError::from_status(status.as_u16(), body))
}

/// Check that `path` exists, is small enough and has a supported extension.
pub fn validate_ocr_file(path: &Path) -> Result<u64, ProviderError> {
    let meta = std::fs::metadata(path)
        .map_err(|_| ProviderError::OcrInput(format!("File not found: {}", path.display())))?;
    if !meta.is_file() {
        return Err(ProviderError::OcrInput(format!("Not a file: {}", path.display())));
    }
    if meta.len() > MAX_OCR_FILE_SIZE {
        return Err(ProviderError::OcrInput(format!(
            "File too large for OCR ({:.1}MB). Maximum: 20MB.",
            meta.len() as f64 / (1024.0 * 1024.0)
        )));
    }
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if !OCR_EXTENSIONS.contains(&ext.as_str()) {
        let supported: Vec<String> = OCR_EXTENSIONS.iter().map(|e| format!(".{e}")).collect();
        return Err(ProviderError::OcrInput(format!(
            "Unsupported file type for OCR: .{}. Supported: {}",
            ext,
            supported.join(", ")
        )));
    }
    Ok(meta.len())
}

#[async_trait]
impl LlmProvider for HttpProvider {
    async fn chat(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        model: &str,
        config: &LlmRequestConfig,
    ) -> Result<LlmResponse, ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::MissingApiKey);
        }

        let thinking = config.thinking && models::supports_thinking(model);
        if config.thinking && !thinking {
            debug!(model, "Model does not support thinking, sending without it");
        }

        debug!(
            model,
            messages = messages.len(),
            tools = tools.map_or(0, |t| t.len()),
            thinking,
            "Calling LLM"
        );

        let body = ChatCompletionRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            tools: tools.filter(|t| !t.is_empty()).map(|t| t.to_vec()),
            tool_choice: tools.filter(|t| !t.is_empty()).map(|_| "auto".to_string()),
            max_tokens: Some(config.max_tokens),
            temperature: Some(config.temperature),
            thinking: thinking.then(ThinkingConfig::enabled),
        };

        let resp = self.with_retries("chat completion", || self.send_chat(&body)).await?;
        debug!(
            has_content = resp.content.is_some(),
            tool_calls = resp.tool_calls.len(),
            finish_reason = resp.finish_reason.as_deref().unwrap_or("?"),
            "LLM response received"
        );
        Ok(resp)
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn display_name(&self) -> &str {
        "Zhipu"
    }
}

#[async_trait]
impl OcrBackend for HttpProvider {
    async fn extract_text(&self, path: &Path) -> Result<String, ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::MissingApiKey);
        }
        let size = validate_ocr_file(path)?;
        debug!(path = %path.display(), size, "Uploading file for OCR");

        let file_id = self
            .with_retries("OCR upload", || self.upload_for_extraction(path))
            .await?;
        let text = self
            .with_retries("OCR fetch", || self.fetch_extracted(&file_id))
            .await?;
        if text.trim().is_empty() {
            warn!(path = %path.display(), "OCR returned no text");
        }
        Ok(text)
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(base: &str) -> HttpProvider {
        HttpProvider::new("test-key", base, "glm-5")
            .unwrap()
            .with_retry(2, Duration::from_millis(1))
    }

    fn text_body(content: &str) -> serde_json::Value {
        json!({
            "id": "chatcmpl-test",
            "choices": [{
                "message": {"content": content},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        })
    }

    #[test]
    fn test_completions_url_trailing_slash() {
        let p = HttpProvider::new("k", "https://open.bigmodel.cn/api/paas/v4/", "glm-5").unwrap();
        assert_eq!(
            p.completions_url(),
            "https://open.bigmodel.cn/api/paas/v4/chat/completions"
        );
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = HttpProvider::new("k", "http://x", "glm-5").unwrap();
        assert_eq!(p.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(p.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(p.backoff_delay(10), MAX_RETRY_DELAY);
    }

    #[tokio::test]
    async fn test_chat_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(text_body("你好")))
            .mount(&server)
            .await;

        let resp = provider(&server.uri())
            .chat(&[Message::user("hi")], None, "glm-4-flash", &LlmRequestConfig::default())
            .await
            .unwrap();

        assert_eq!(resp.content.as_deref(), Some("你好"));
        assert!(!resp.has_tool_calls());
        assert_eq!(resp.usage.unwrap().total_tokens, 15);
    }

    #[tokio::test]
    async fn test_chat_with_tool_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({"tool_choice": "auto"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {
                        "content": null,
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {"name": "file_list", "arguments": "{\"path\": \".\"}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }]
            })))
            .mount(&server)
            .await;

        let tools = vec![ToolDefinition::new("file_list", "List files", json!({"type": "object"}))];
        let resp = provider(&server.uri())
            .chat(&[Message::user("ls")], Some(&tools), "glm-5", &LlmRequestConfig::default())
            .await
            .unwrap();

        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].function.name, "file_list");
    }

    #[tokio::test]
    async fn test_thinking_sent_only_to_supporting_models() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(text_body("ok")))
            .mount(&server)
            .await;

        let p = provider(&server.uri());
        let cfg = LlmRequestConfig {
            thinking: true,
            ..Default::default()
        };
        p.chat(&[Message::user("a")], None, "glm-5", &cfg).await.unwrap();
        p.chat(&[Message::user("b")], None, "glm-4-flash", &cfg).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let first: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        let second: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
        assert_eq!(first["thinking"]["type"], "enabled");
        assert!(second.get("thinking").is_none());
    }

    #[tokio::test]
    async fn test_auth_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .expect(1)
            .mount(&server)
            .await;

        let err = provider(&server.uri())
            .chat(&[Message::user("hi")], None, "glm-5", &LlmRequestConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Auth { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_rate_limit_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(text_body("after retry")))
            .mount(&server)
            .await;

        let resp = provider(&server.uri())
            .chat(&[Message::user("hi")], None, "glm-5", &LlmRequestConfig::default())
            .await
            .unwrap();
        assert_eq!(resp.content.as_deref(), Some("after retry"));
    }

    #[tokio::test]
    async fn test_server_error_exhausts_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .expect(3)
            .mount(&server)
            .await;

        let err = provider(&server.uri())
            .chat(&[Message::user("hi")], None, "glm-5", &LlmRequestConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Server { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let p = HttpProvider::new("", "http://127.0.0.1:9", "glm-5").unwrap();
        let err = p
            .chat(&[Message::user("hi")], None, "glm-5", &LlmRequestConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::MissingApiKey));
    }

    #[tokio::test]
    async fn test_ocr_upload_and_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "file-42"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/file-42/content"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"content": "Invoice #7"})),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let scan = dir.path().join("scan.png");
        std::fs::write(&scan, b"\x89PNG fake").unwrap();

        let text = provider(&server.uri()).extract_text(&scan).await.unwrap();
        assert_eq!(text, "Invoice #7");
    }

    #[test]
    fn test_validate_ocr_file() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("notes.docx");
        std::fs::write(&doc, b"x").unwrap();
        let err = validate_ocr_file(&doc).unwrap_err().to_string();
        assert!(err.contains("Unsupported file type"));

        let missing = validate_ocr_file(&dir.path().join("nope.pdf")).unwrap_err();
        assert!(missing.to_string().contains("File not found"));

        let pdf = dir.path().join("Report.PDF");
        std::fs::write(&pdf, b"%PDF").unwrap();
        assert_eq!(validate_ocr_file(&pdf).unwrap(), 4);
    }
}
