// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Inference transport for judge models

use crate::config::JudgeConfig;
use crate::error::{JudgeError, Result};
use crate::models::Message;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

pub const CHAT_COMPLETIONS_ENDPOINT: &str = "/v1/chat/completions";
pub const COMPLETIONS_ENDPOINT: &str = "/v1/completions";
pub const MODELS_ENDPOINT: &str = "/v1/models";

const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// What an inference call hands back
#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutput {
    /// Generated text of the first choice
    Text(String),
    /// Raw `choices` array, for parsers that need log-probabilities
    Choices(Vec<Value>),
}

impl ModelOutput {
    /// Text view of the output; choices are rendered as JSON
    pub fn into_text(self) -> String {
        match self {
            ModelOutput::Text(text) => text,
            ModelOutput::Choices(choices) => Value::Array(choices).to_string(),
        }
    }
}

/// Trait for inference backends used by the judge
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Chat completion over role/content messages
    async fn chat_completion(
        &self,
        messages: &[Message],
        sampling_params: &Map<String, Value>,
        return_choices: bool,
    ) -> Result<ModelOutput>;

    /// Plain completion over a flattened prompt
    async fn completion(
        &self,
        prompt: &str,
        sampling_params: &Map<String, Value>,
        return_choices: bool,
    ) -> Result<ModelOutput>;

    /// Model identifiers served by the endpoint
    async fn list_models(&self) -> Result<Vec<String>>;

    /// First available model
    async fn detect_model(&self) -> Result<String> {
        self.list_models()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| JudgeError::Connection("No models available on vLLM server".to_string()))
    }
}

/// Client for an OpenAI-compatible vLLM server
pub struct VllmClient {
    config: JudgeConfig,
    client: reqwest::Client,
}

impl VllmClient {
    pub fn new(config: JudgeConfig) -> Result<Self> {
        let config = config.normalized()?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &JudgeConfig {
        &self.config
    }

    /// Set the model used in request bodies
    pub fn set_model(&mut self, model: impl Into<String>) {
        self.config.model = Some(model.into());
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.base_url, endpoint)
    }

    /// `{model, <key>: <payload>}` extended with config defaults then the caller overlay
    fn request_body(&self, key: &str, payload: Value, sampling_params: &Map<String, Value>) -> Value {
        let mut body = Map::new();
        if let Some(model) = &self.config.model {
            body.insert("model".to_string(), json!(model));
        }
        body.insert(key.to_string(), payload);
        body.extend(self.config.sampling_params());
        body.extend(sampling_params.iter().map(|(k, v)| (k.clone(), v.clone())));
        Value::Object(body)
    }

    fn map_send_error(&self, e: reqwest::Error) -> JudgeError {
        if e.is_timeout() {
            JudgeError::Timeout(format!(
                "Request timed out after {}s: {}",
                self.config.timeout_secs, e
            ))
        } else if e.is_connect() {
            JudgeError::Connection(format!(
                "Failed to connect to {}: {}",
                self.config.base_url, e
            ))
        } else {
            JudgeError::Connection(format!("Unexpected error: {}", e))
        }
    }

    async fn send_once(&self, endpoint: &str, body: Option<&Value>) -> Result<Value> {
        let request = match body {
            Some(body) => self.client.post(self.url(endpoint)).json(body),
            None => self.client.get(self.url(endpoint)),
        };

        let response = request
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(JudgeError::Connection(format!(
                "HTTP {}: {}",
                status.as_u16(),
                error_detail(status, &text)
            )));
        }

        response.json::<Value>().await.map_err(|e| {
            if e.is_timeout() {
                self.map_send_error(e)
            } else {
                JudgeError::Connection(format!("Unexpected error: {}", e))
            }
        })
    }

    /// Send with exponential backoff on connectivity and timeout failures
    async fn send_with_retry(&self, endpoint: &str, body: Option<&Value>) -> Result<Value> {
        let attempts = self.config.max_retries.max(1);
        let mut attempt = 0;

        loop {
            match self.send_once(endpoint, body).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    if attempt >= attempts {
                        if attempts == 1 {
                            return Err(e);
                        }
                        return Err(JudgeError::RetryExhausted {
                            message: format!("Request failed after {} attempts: {}", attempts, e),
                            last_error: Box::new(e),
                        });
                    }
                    let delay = backoff_delay(self.config.retry_delay_secs, attempt);
                    warn!(
                        "Retry attempt {} for {} after error: {} (waiting {:?})",
                        attempt + 1,
                        endpoint,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post_generation(
        &self,
        endpoint: &str,
        body: Value,
        return_choices: bool,
        text_pointer: &str,
    ) -> Result<ModelOutput> {
        let response = self.send_with_retry(endpoint, Some(&body)).await?;

        let choices = match response.get("choices") {
            Some(Value::Array(choices)) if !choices.is_empty() => choices.clone(),
            _ => {
                return Err(JudgeError::parse(
                    "Invalid response format: missing choices",
                    response.to_string(),
                ))
            }
        };

        if return_choices {
            return Ok(ModelOutput::Choices(choices));
        }

        choices[0]
            .pointer(text_pointer)
            .and_then(Value::as_str)
            .map(|text| ModelOutput::Text(text.to_string()))
            .ok_or_else(|| {
                JudgeError::parse(
                    "Invalid response format: choice has no text",
                    response.to_string(),
                )
            })
    }
}

/// Response body `detail` field, else the body or the status reason
fn error_detail(status: StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(detail) = value.get("detail") {
            return match detail {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
        }
    }
    if body.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        body.trim().to_string()
    }
}

/// `base * 2^attempt` seconds, capped at ten seconds
pub(crate) fn backoff_delay(base_secs: f64, attempt: u32) -> Duration {
    let secs = base_secs.max(0.0) * 2f64.powi(attempt.min(16) as i32);
    Duration::try_from_secs_f64(secs).map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
}

#[async_trait]
impl InferenceClient for VllmClient {
    async fn chat_completion(
        &self,
        messages: &[Message],
        sampling_params: &Map<String, Value>,
        return_choices: bool,
    ) -> Result<ModelOutput> {
        let body = self.request_body("messages", serde_json::to_value(messages)?, sampling_params);
        debug!("POST {} ({} messages)", CHAT_COMPLETIONS_ENDPOINT, messages.len());
        self.post_generation(CHAT_COMPLETIONS_ENDPOINT, body, return_choices, "/message/content")
            .await
    }

    async fn completion(
        &self,
        prompt: &str,
        sampling_params: &Map<String, Value>,
        return_choices: bool,
    ) -> Result<ModelOutput> {
        let body = self.request_body("prompt", json!(prompt), sampling_params);
        debug!("POST {} ({} chars)", COMPLETIONS_ENDPOINT, prompt.len());
        self.post_generation(COMPLETIONS_ENDPOINT, body, return_choices, "/text")
            .await
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let response = self.send_with_retry(MODELS_ENDPOINT, None).await?;
        Ok(response
            .get("data")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }
}
