//! LLM completion services.
//!
//! Defines the [`LlmClient`] trait with the two call shapes the pipeline
//! needs — schema-guided JSON generation and token-streaming chat — plus the
//! OpenAI-compatible HTTP implementation.
//!
//! # Retry Strategy
//!
//! JSON generation retries transient errors with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Schema-validation retries are the *caller's* concern: the analyzer and
//! comparator re-invoke `generate_json` when the returned object fails their
//! validation, with their own attempt budget.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::LlmConfig;

/// One chat message in provider-neutral form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// LLM backend used by the analyzer, comparator, and orchestrator.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Request a JSON object completion. The prompt is expected to describe
    /// the schema; the returned value is parsed but not validated here.
    async fn generate_json(&self, system: &str, prompt: &str) -> Result<serde_json::Value>;

    /// Stream a chat completion, forwarding each text delta through `tx` as
    /// it arrives. Returns the full accumulated text.
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        tx: mpsc::Sender<String>,
    ) -> Result<String>;
}

/// OpenAI-compatible chat completions client.
pub struct OpenAiClient {
    client: reqwest::Client,
    config: LlmConfig,
    api_key: String,
}

impl OpenAiClient {
    /// # Errors
    ///
    /// Returns an error if the configured API key environment variable is
    /// not set.
    pub fn new(config: LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow!("{} environment variable not set", config.api_key_env))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    fn request_body(&self, messages: &[ChatMessage], json_mode: bool, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "messages": messages,
            "stream": stream,
        });
        if json_mode {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }
        body
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate_json(&self, system: &str, prompt: &str) -> Result<serde_json::Value> {
        let messages = vec![ChatMessage::system(system), ChatMessage::user(prompt)];
        let body = self.request_body(&messages, true, false);

        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.config.base_url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_completion_content(&json);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow!("LLM API error {}: {}", status, body_text));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("LLM API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("LLM call failed after retries")))
    }

    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        tx: mpsc::Sender<String>,
    ) -> Result<String> {
        let body = self.request_body(&messages, false, true);

        let response = self
            .client
            .post(&self.config.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("LLM API error {}: {}", status, body_text);
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut accumulated = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Process complete SSE lines
            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim().to_string();
                buffer = buffer[line_end + 1..].to_string();

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    return Ok(accumulated);
                }
                if let Some(delta) = parse_stream_delta(data) {
                    accumulated.push_str(&delta);
                    let _ = tx.send(delta).await;
                }
            }
        }

        Ok(accumulated)
    }
}

/// Extract `choices[0].message.content` from a completion response and parse
/// it as JSON.
fn parse_completion_content(response: &serde_json::Value) -> Result<serde_json::Value> {
    let content = response["choices"]
        .as_array()
        .and_then(|choices| choices.first())
        .and_then(|choice| choice["message"]["content"].as_str())
        .ok_or_else(|| anyhow!("Invalid LLM response: missing choices[0].message.content"))?;

    serde_json::from_str(content)
        .map_err(|e| anyhow!("LLM returned content that is not valid JSON: {}", e))
}

/// Extract the text delta from one SSE data payload, if any.
fn parse_stream_delta(data: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(data).ok()?;
    json["choices"]
        .as_array()?
        .first()?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn completion_content_is_parsed_as_json() {
        let response = json!({
            "choices": [{
                "message": { "content": "{\"ok\": true}" }
            }]
        });
        let value = parse_completion_content(&response).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn non_json_content_is_an_error() {
        let response = json!({
            "choices": [{ "message": { "content": "sorry, I cannot" } }]
        });
        assert!(parse_completion_content(&response).is_err());
    }

    #[test]
    fn missing_choices_is_an_error() {
        assert!(parse_completion_content(&json!({})).is_err());
    }

    #[test]
    fn stream_delta_extraction() {
        let data = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_stream_delta(data), Some("Hel".to_string()));

        // Role-only first chunk has no content delta
        let role_only = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_stream_delta(role_only), None);

        assert_eq!(parse_stream_delta("not json"), None);
    }
}
