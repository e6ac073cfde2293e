//! Provider failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no API key configured (set ZHI_API_KEY or apiKey in ~/.zhi/config.json)")]
    MissingApiKey,

    #[error("authentication failed ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("could not decode response: {0}")]
    Decode(String),

    #[error("API returned an empty response (no choices)")]
    EmptyResponse,

    #[error("OCR rejected: {0}")]
    OcrInput(String),
}

impl ProviderError {
    /// Whether the call may succeed if repeated.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimited(_)
            | ProviderError::Server { .. }
            | ProviderError::EmptyResponse => true,
            ProviderError::Request(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Map a non-success HTTP status and its body to an error.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => ProviderError::Auth { status, message },
            429 => ProviderError::RateLimited(message),
            500..=599 => ProviderError::Server { status, message },
            _ => ProviderError::Api { status, message },
        }
    }
}
