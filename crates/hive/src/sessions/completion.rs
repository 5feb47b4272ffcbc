//! Chat completion collaborator.
//!
//! Sessions hand a system prompt plus history to a [`Completion`] and get
//! back the next line to speak. The stock implementation talks to any
//! OpenAI-compatible `/v1/chat/completions` endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatTurn>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// OpenAI-compatible chat completion client.
#[derive(Debug, Clone)]
pub struct OpenAiCompletion {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompletion {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub fn from_config(services: &hiveconf::ServicesConfig) -> Self {
        Self::new(&services.llm_url, &services.api_key)
    }
}

#[async_trait]
impl Completion for OpenAiCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let mut builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(request)
            .timeout(COMPLETION_TIMEOUT);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let resp = builder
            .send()
            .await
            .context("Failed to call chat completion API")?;

        let status = resp.status();
        if !status.is_success() {
            let error_body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read error body>".to_string());
            anyhow::bail!("Chat completion API error {}: {}", status, error_body);
        }

        let body: CompletionResponse = resp
            .json()
            .await
            .context("Failed to parse chat completion response")?;

        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .context("Chat completion returned no choices")
    }
}
