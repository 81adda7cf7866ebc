//! AI client for the generated personalization modes.
//!
//! Thin chat-completions wrapper: one prompt in, one string out. The
//! personalizer owns prompts, validation, and fallback behavior.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use crate::config::AiConfig;
use crate::error::PersonalizeError;

/// Provider-agnostic completion handle.
#[async_trait]
pub trait AiClient: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, PersonalizeError>;
}

/// HTTP client against an OpenAI-compatible chat-completions endpoint.
pub struct HttpAiClient {
    http: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
    default_max_tokens: u32,
}

impl HttpAiClient {
    pub fn new(config: &AiConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: SecretString::from(config.api_key.clone()),
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            default_max_tokens: config.max_tokens,
        }
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[async_trait]
impl AiClient for HttpAiClient {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, PersonalizeError> {
        let max_tokens = if max_tokens == 0 {
            self.default_max_tokens
        } else {
            max_tokens
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&json!({
                "model": self.model,
                "messages": [{"role": "user", "content": prompt}],
                "temperature": 0.7,
                "max_tokens": max_tokens,
            }))
            .send()
            .await
            .map_err(|e| PersonalizeError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PersonalizeError::RequestFailed(format!(
                "{status}: {body}"
            )));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| PersonalizeError::InvalidResponse(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .unwrap_or_default();

        if content.is_empty() {
            return Err(PersonalizeError::InvalidResponse("empty completion".into()));
        }
        Ok(content)
    }
}
