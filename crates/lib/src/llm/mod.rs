//! Chat model abstraction and the Ollama client.
//!
//! The dispatcher only sees [`ChatModel`]; the Ollama client is one implementation.

mod ollama;

use async_trait::async_trait;
use std::time::Duration;

pub use ollama::{ChatMessage, OllamaClient, OllamaError, OllamaModel};

/// Default model when none is configured.
pub const DEFAULT_MODEL: &str = "llama3.2:latest";

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("model request failed: {0}")]
    Request(String),
    #[error("model api error: {0}")]
    Api(String),
}

impl From<OllamaError> for LlmError {
    fn from(e: OllamaError) -> Self {
        match e {
            OllamaError::Request(e) => LlmError::Request(e.to_string()),
            OllamaError::Api(s) => LlmError::Api(s),
        }
    }
}

/// One chat completion: ordered messages in, assistant text out.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String, LlmError>;
}

/// Failure of a long-latency upstream call (model, search).
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
}

/// Await `fut` for at most `limit`; an elapsed deadline becomes [`UpstreamError::Timeout`].
pub async fn bounded<T, E, F>(limit: Duration, fut: F) -> Result<T, UpstreamError>
where
    F: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(UpstreamError::Unavailable(e.to_string())),
        Err(_) => Err(UpstreamError::Timeout(limit)),
    }
}
