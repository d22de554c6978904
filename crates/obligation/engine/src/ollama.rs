//! Drafter backed by a local Ollama server.

use std::time::Duration;

use async_trait::async_trait;
use obligation_types::IntentContext;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{millis, ExternalError, ExternalResult};
use crate::external::Drafter;

pub const DEFAULT_OLLAMA_ENDPOINT: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.1:8b";

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

/// Calls `POST {endpoint}/api/generate` to write a draft reply.
#[derive(Debug, Clone)]
pub struct OllamaDrafter {
    client: Client,
    endpoint: String,
    model: String,
    temperature: Option<f32>,
    timeout: Duration,
}

impl OllamaDrafter {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, timeout: Duration) -> ExternalResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| ExternalError::Permanent(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            temperature: None,
            timeout,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    fn url(&self) -> String {
        format!("{}/api/generate", self.endpoint.trim_end_matches('/'))
    }

    fn payload(&self, context: &IntentContext) -> Value {
        let mut payload = json!({
            "model": self.model,
            "prompt": compose_prompt(context),
            "stream": false,
        });
        if let Some(temperature) = self.temperature {
            payload["options"] = json!({ "temperature": temperature });
        }
        payload
    }
}

#[async_trait]
impl Drafter for OllamaDrafter {
    async fn draft(&self, context: &IntentContext) -> ExternalResult<String> {
        debug!(obligation_id = %context.obligation_id, model = %self.model, "Requesting draft");

        let response = self
            .client
            .post(self.url())
            .json(&self.payload(context))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExternalError::Timeout {
                        timeout_ms: millis(self.timeout),
                    }
                } else {
                    ExternalError::Transient(format!("ollama request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body: OllamaResponse = response
            .json()
            .await
            .map_err(|e| ExternalError::Transient(format!("invalid ollama response: {}", e)))?;

        let draft = body.response.trim().to_string();
        if draft.is_empty() {
            return Err(ExternalError::Transient("ollama returned an empty draft".to_string()));
        }
        Ok(draft)
    }
}

fn classify_status(status: StatusCode, body: &str) -> ExternalError {
    let message = format!("ollama error {}: {}", status, truncate(body, 320));
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT {
        ExternalError::Transient(message)
    } else {
        ExternalError::Permanent(message)
    }
}

fn compose_prompt(context: &IntentContext) -> String {
    let mut prompt = format!(
        "Write a short, polite follow-up message to {} about the following commitment.\n\
         Commitment: {}\nType: {}\nOriginal deadline: {}\nHours overdue: {}\n",
        context.counterparty.display_name(),
        context.action.trim(),
        context.obligation_type,
        context.deadline.format("%Y-%m-%d %H:%M UTC"),
        context.overdue_by().num_hours().max(0),
    );
    if let Some(description) = context.description.as_deref().filter(|d| !d.trim().is_empty()) {
        prompt.push_str("Details: ");
        prompt.push_str(description.trim());
        prompt.push('\n');
    }
    prompt.push_str("Reply with the message text only.");
    prompt
}

fn truncate(value: &str, max_chars: usize) -> String {
    let mut chars = value.chars();
    let truncated: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}
