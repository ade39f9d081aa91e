use crate::config::AgentConfig;
use crate::error::{AgentError, BackendError};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Chat-completion capability the agent depends on.
///
/// Implementations must map every failure (transport, non-2xx status,
/// timeout, malformed body, empty content) into a [`BackendError`].
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
    ) -> std::result::Result<String, BackendError>;
}

/// OpenAI-compatible `/chat/completions` client.
#[derive(Clone)]
pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String, timeout: Duration) -> Self {
        Self {
            api_key,
            base_url,
            model,
            timeout,
            http: reqwest::Client::new(),
        }
    }

    /// Build a client from configuration. Fails when no credential is set.
    pub fn from_config(config: &AgentConfig) -> crate::error::Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(AgentError::Configuration("missing LLM credential".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(config.backend_timeout)
            .build()
            .map_err(|e| AgentError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            timeout: config.backend_timeout,
            http,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt}
            ],
            "temperature": 0.1,
        });

        // Reasoning models spend part of the budget on hidden tokens and only
        // accept max_completion_tokens.
        if self.model.starts_with("gpt-5") || self.model.starts_with("o1") {
            body["max_completion_tokens"] = serde_json::json!(max_tokens.saturating_mul(4));
        } else if self.model.starts_with("gpt-4") {
            body["max_completion_tokens"] = serde_json::json!(max_tokens);
        } else {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        body
    }
}

#[async_trait]
impl LlmBackend for LlmClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
    ) -> std::result::Result<String, BackendError> {
        let body = self.request_body(system_prompt, user_prompt, max_tokens);
        debug!("Calling {} with {} prompt chars", self.model, user_prompt.len());

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(self.timeout.as_millis() as u64)
                } else {
                    BackendError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: error_text,
            });
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(format!("Failed to parse LLM response: {}", e)))?;

        extract_content(&response_json)
    }
}

/// Pull the first choice's message content out of a chat-completions body.
pub fn extract_content(
    response_json: &serde_json::Value,
) -> std::result::Result<String, BackendError> {
    if let Some(error) = response_json.get("error") {
        return Err(BackendError::Malformed(format!("LLM API error: {}", error)));
    }

    let choices = response_json
        .get("choices")
        .and_then(|c| c.as_array())
        .ok_or_else(|| BackendError::Malformed("No choices array in LLM response".to_string()))?;

    let first = choices
        .first()
        .ok_or_else(|| BackendError::Malformed("Empty choices array in LLM response".to_string()))?;

    match first.get("finish_reason").and_then(|r| r.as_str()) {
        Some("length") => warn!("LLM response was truncated due to length limit"),
        Some("content_filter") => {
            return Err(BackendError::Malformed(
                "LLM response was filtered by content policy".to_string(),
            ))
        }
        _ => {}
    }

    let content = first["message"]["content"]
        .as_str()
        .ok_or_else(|| BackendError::Malformed("No content in LLM response".to_string()))?;

    if content.trim().is_empty() {
        return Err(BackendError::Malformed("Empty content in LLM response".to_string()));
    }

    Ok(content.to_string())
}

/// Remove markdown code fences models like to wrap JSON in.
pub fn strip_code_fences(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```JSON")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}
