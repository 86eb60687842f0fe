use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;

use super::config::{validate_config, LlmConfig};
use crate::core::error::ValidationError;
use crate::core::feed::fetcher::RetryPolicy;

const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("invalid llm config: {0}")]
    InvalidConfig(#[from] ValidationError),
    #[error("provider rejected credentials (status {0})")]
    Auth(u16),
    #[error("provider rate limited the request")]
    RateLimited,
    #[error("provider server error (status {0})")]
    Server(u16),
    #[error("unexpected provider status {0}")]
    Http(u16),
    #[error("provider request timed out")]
    Timeout,
    #[error("provider request failed: {0}")]
    Network(String),
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Server(_))
    }

    fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            401 | 403 => Self::Auth(status.as_u16()),
            429 => Self::RateLimited,
            code if code >= 500 => Self::Server(code),
            code => Self::Http(code),
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_decode() {
            Self::InvalidResponse(error.to_string())
        } else {
            Self::Network(error.to_string())
        }
    }
}

/// A system and a user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub model: Option<String>,
}

/// Chat-completions client. Rate limits and server errors are retried a
/// few times; everything else surfaces on the first failure.
#[derive(Debug, Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    backoff: RetryPolicy,
}

impl LlmClient {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("rssr/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::from_client(http))
    }

    pub fn from_client(http: reqwest::Client) -> Self {
        Self {
            http,
            backoff: RetryPolicy::new(MAX_ATTEMPTS - 1),
        }
    }

    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.backoff = self.backoff.with_delays(base_delay, max_delay);
        self
    }

    pub async fn complete(&self, config: &LlmConfig, prompt: &Prompt) -> Result<String, LlmError> {
        Ok(self.chat(config, prompt).await?.text)
    }

    /// Sends a trivial prompt and returns the model the provider reports.
    pub async fn test_connection(&self, config: &LlmConfig) -> Result<String, LlmError> {
        let prompt = Prompt::new("You are a connectivity checker.", "Reply with exactly: ok");
        let completion = self.chat(config, &prompt).await?;
        Ok(completion.model.unwrap_or_else(|| config.model.clone()))
    }

    async fn chat(&self, config: &LlmConfig, prompt: &Prompt) -> Result<Completion, LlmError> {
        validate_config(config)?;
        let endpoint = config.endpoint();
        let request = ChatRequest {
            model: &config.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: 0.2,
            stream: false,
        };

        let mut attempt = 0_u32;
        loop {
            match self.send_once(config, &endpoint, &request).await {
                Ok(completion) => return Ok(completion),
                Err(error) if error.is_retryable() && attempt < self.backoff.retries => {
                    let delay = self.backoff.delay_for(attempt);
                    tracing::debug!(
                        model = %config.model,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "llm request failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    tracing::debug!(model = %config.model, attempt, %error, "llm request failed");
                    return Err(error);
                }
            }
        }
    }

    async fn send_once(
        &self,
        config: &LlmConfig,
        endpoint: &str,
        request: &ChatRequest<'_>,
    ) -> Result<Completion, LlmError> {
        let response = self
            .http
            .post(endpoint)
            .bearer_auth(&config.api_key)
            .timeout(config.timeout())
            .json(request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::from_status(status));
        }

        let body = response.text().await?;
        let value: Value = serde_json::from_str(&body)
            .map_err(|error| LlmError::InvalidResponse(format!("body is not json: {error}")))?;
        extract_completion(&value)
    }
}

fn extract_completion(value: &Value) -> Result<Completion, LlmError> {
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(LlmError::InvalidResponse(message));
    }
    let text = value
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(str::trim)
        .ok_or_else(|| LlmError::InvalidResponse("missing choices[0].message.content".to_string()))?;
    Ok(Completion {
        text: text.to_string(),
        model: value
            .get("model")
            .and_then(Value::as_str)
            .map(ToString::to_string),
    })
}
