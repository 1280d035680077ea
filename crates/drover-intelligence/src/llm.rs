//! LLM provider abstraction.
//!
//! A unified async trait over chat-completion providers plus a mock with
//! queued responses for tests. drover only needs short, non-streaming
//! calls: review classification, stuck detection, extraction, and inbound
//! query summaries.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LlmError {
    /// HTTP-level failure (connection, DNS, TLS).
    #[error("http error: {0}")]
    Http(String),

    /// The API returned a non-success status with a message.
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Failed to parse the response body.
    #[error("parse error: {0}")]
    Parse(String),

    /// HTTP 429 / overload; callers back off without burning a retry.
    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The request timed out.
    #[error("request timed out")]
    Timeout,
}

impl LlmError {
    /// Transient upstream errors cool down; everything else counts as a
    /// real failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. } | LlmError::Timeout | LlmError::Http(_)
        ) || matches!(self, LlmError::Api { status, .. } if *status >= 500)
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Http(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Core data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    System,
    User,
    Assistant,
}

impl fmt::Display for LlmRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmRole::System => write!(f, "system"),
            LlmRole::User => write!(f, "user"),
            LlmRole::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: LlmRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: LlmRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: LlmRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "claude-haiku-4-5".to_string(),
            max_tokens: 1024,
            temperature: 0.0,
        }
    }
}

impl LlmConfig {
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

// ---------------------------------------------------------------------------
// LlmProvider trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a completion request and return the full response.
    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError>;
}

// ---------------------------------------------------------------------------
// AnthropicProvider
// ---------------------------------------------------------------------------

/// Provider for the Anthropic Messages API.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".to_string(),
        }
    }

    /// Override the base URL (testing, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Build the Messages API request body. System messages accumulate into
    /// the top-level `system` field; they are not legal in `messages`.
    pub fn build_request_body(messages: &[LlmMessage], config: &LlmConfig) -> serde_json::Value {
        let mut system_text = String::new();
        let api_messages: Vec<serde_json::Value> = messages
            .iter()
            .filter_map(|msg| {
                if msg.role == LlmRole::System {
                    if !system_text.is_empty() {
                        system_text.push('\n');
                    }
                    system_text.push_str(&msg.content);
                    None
                } else {
                    Some(serde_json::json!({
                        "role": msg.role.to_string(),
                        "content": msg.content,
                    }))
                }
            })
            .collect();

        let mut body = serde_json::json!({
            "model": config.model,
            "max_tokens": config.max_tokens,
            "temperature": config.temperature,
            "messages": api_messages,
        });
        if !system_text.is_empty() {
            body["system"] = serde_json::Value::String(system_text);
        }
        body
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
    model: String,
    usage: ApiUsage,
}

#[derive(Deserialize)]
struct ApiContentBlock {
    #[serde(rename = "type")]
    _type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct ApiUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        let body = Self::build_request_body(messages, config);
        let url = format!("{}/v1/messages", self.base_url);

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 || status == 529 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            tracing::warn!(status, ?retry_after, "upstream rate limit");
            return Err(LlmError::RateLimited {
                retry_after_secs: retry_after,
            });
        }
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, message });
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        let content = api_resp
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(LlmResponse {
            content,
            model: api_resp.model,
            input_tokens: api_resp.usage.input_tokens,
            output_tokens: api_resp.usage.output_tokens,
        })
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// Test provider that replays queued responses and records the prompts it
/// was called with. An empty queue yields an Api error, which surfaces
/// accidental extra calls in tests.
#[derive(Default)]
pub struct MockProvider {
    queue: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: Mutex<Vec<Vec<LlmMessage>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, content: impl Into<String>) {
        self.queue
            .lock()
            .expect("mock queue lock poisoned")
            .push_back(Ok(content.into()));
    }

    pub fn push_error(&self, err: LlmError) {
        self.queue
            .lock()
            .expect("mock queue lock poisoned")
            .push_back(Err(err));
    }

    /// The message lists of every call made so far.
    pub fn calls(&self) -> Vec<Vec<LlmMessage>> {
        self.calls.lock().expect("mock calls lock poisoned").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("mock calls lock poisoned").len()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        self.calls
            .lock()
            .expect("mock calls lock poisoned")
            .push(messages.to_vec());

        let next = self
            .queue
            .lock()
            .expect("mock queue lock poisoned")
            .pop_front();
        match next {
            Some(Ok(content)) => Ok(LlmResponse {
                content,
                model: config.model.clone(),
                input_tokens: 10,
                output_tokens: 5,
            }),
            Some(Err(err)) => Err(err),
            None => Err(LlmError::Api {
                status: 500,
                message: "mock queue exhausted".into(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_hoists_system_messages() {
        let messages = vec![
            LlmMessage::system("be terse"),
            LlmMessage::system("answer in json"),
            LlmMessage::user("classify this"),
        ];
        let body =
            AnthropicProvider::build_request_body(&messages, &LlmConfig::default());

        assert_eq!(body["system"], "be terse\nanswer in json");
        let api_messages = body["messages"].as_array().unwrap();
        assert_eq!(api_messages.len(), 1);
        assert_eq!(api_messages[0]["role"], "user");
    }

    #[test]
    fn request_body_without_system_has_no_system_field() {
        let messages = vec![LlmMessage::user("hi")];
        let body =
            AnthropicProvider::build_request_body(&messages, &LlmConfig::default());
        assert!(body.get("system").is_none());
    }

    #[test]
    fn transient_classification() {
        assert!(LlmError::RateLimited {
            retry_after_secs: None
        }
        .is_transient());
        assert!(LlmError::Timeout.is_transient());
        assert!(LlmError::Api {
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(!LlmError::Api {
            status: 400,
            message: String::new()
        }
        .is_transient());
        assert!(!LlmError::Parse("bad".into()).is_transient());
    }

    #[tokio::test]
    async fn mock_replays_in_order_and_records_calls() {
        let mock = MockProvider::new();
        mock.push_response("first");
        mock.push_error(LlmError::Timeout);
        mock.push_response("second");

        let config = LlmConfig::default();
        let messages = vec![LlmMessage::user("q")];

        let a = mock.complete(&messages, &config).await.unwrap();
        assert_eq!(a.content, "first");
        assert!(matches!(
            mock.complete(&messages, &config).await.unwrap_err(),
            LlmError::Timeout
        ));
        let b = mock.complete(&messages, &config).await.unwrap();
        assert_eq!(b.content, "second");

        assert_eq!(mock.call_count(), 3);
        assert_eq!(mock.calls()[0][0].content, "q");
    }

    #[tokio::test]
    async fn exhausted_mock_errors() {
        let mock = MockProvider::new();
        let err = mock
            .complete(&[LlmMessage::user("q")], &LlmConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Api { status: 500, .. }));
    }
}
