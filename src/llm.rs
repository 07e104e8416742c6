//! Language model collaborator.
//!
//! [`ChatModel`] is the seam between the orchestrator and whatever produces
//! answers. [`OpenAiChat`] implements it against an OpenAI-compatible
//! `/chat/completions` endpoint.
//!
//! # Retry Strategy
//!
//! - HTTP 429 and 5xx → retry with exponential backoff (1s, 2s, 4s, … capped
//!   at 32s), honouring a numeric `Retry-After` header when present
//! - Other 4xx → [`GenerationError::InvalidRequest`] immediately
//! - Transport errors → retry, then [`GenerationError::Network`]
//!
//! No request timeout is applied unless `openAI.timeout_secs` is set.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::OpenAiConfig;
use crate::error::GenerationError;
use crate::models::ChatMessage;

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Identifier passed to the tokenizer for cost accounting.
    fn model_name(&self) -> &str;

    /// Produce a completion for `context`, whose last message is the live query.
    async fn generate(
        &self,
        context: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, GenerationError>;
}

pub struct OpenAiChat {
    model: String,
    api_key: String,
    endpoint: String,
    client: reqwest::Client,
    max_retries: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiChat {
    /// Build a client from configuration, reading `OPENAI_API_KEY`.
    pub fn new(config: &OpenAiConfig) -> Result<Self, GenerationError> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            GenerationError::Unavailable("OPENAI_API_KEY environment variable not set".to_string())
        })?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &OpenAiConfig, api_key: String) -> Result<Self, GenerationError> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder
            .build()
            .map_err(|e| GenerationError::Unavailable(e.to_string()))?;

        Ok(Self {
            model: config.model.clone(),
            api_key,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            client,
            max_retries: config.max_retries,
        })
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt.saturating_sub(1).min(5))
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl ChatModel for OpenAiChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        context: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, GenerationError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": context,
            "temperature": temperature,
            "max_tokens": max_tokens,
        });

        let mut last_err = None;
        let mut wait = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(wait.take().unwrap_or_else(|| backoff(attempt))).await;
            }

            let response = match self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "chat request failed");
                    last_err = Some(GenerationError::Network(e.to_string()));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                let parsed: CompletionResponse = response
                    .json()
                    .await
                    .map_err(|e| GenerationError::MalformedResponse(e.to_string()))?;
                return parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .ok_or_else(|| {
                        GenerationError::MalformedResponse("response has no message content".to_string())
                    });
            }

            let retry_after = retry_after(response.headers());
            let message = response.text().await.unwrap_or_default();
            let code = status.as_u16();

            if code == 429 {
                tracing::debug!(attempt, "chat request rate limited");
                wait = retry_after;
                last_err = Some(GenerationError::Quota {
                    message,
                    retry_after,
                });
            } else if status.is_server_error() {
                tracing::debug!(attempt, status = code, "chat provider error");
                last_err = Some(GenerationError::Api {
                    status: code,
                    message,
                });
            } else {
                return Err(GenerationError::InvalidRequest {
                    status: code,
                    message,
                });
            }
        }

        Err(last_err.unwrap_or_else(|| {
            GenerationError::Network("chat request failed after retries".to_string())
        }))
    }
}
