use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::agent_api::{ChatMessage, StreamChunk};
use std::env;
use tokio::sync::mpsc::UnboundedSender;

use crate::{error_detail, SHARED_HTTP};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

// ── Request types ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

// ── Non-streaming response types ─────────────────────────────────────

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

// ── Streaming response types ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    error: Option<OpenAIStreamError>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamDelta {
    #[serde(default)]
    content: Option<String>,
    /// DeepSeek-style reasoning field
    #[serde(default)]
    reasoning_content: Option<String>,
    /// OpenRouter-style reasoning field
    #[serde(default)]
    reasoning: Option<String>,
}

/// Decode one SSE `data:` payload into the chunks it carries, in order.
fn decode_stream_data(data: &str) -> Vec<StreamChunk> {
    if data == "[DONE]" {
        return vec![StreamChunk::Done { stop_reason: None }];
    }
    let resp = match serde_json::from_str::<OpenAIStreamResponse>(data) {
        Ok(resp) => resp,
        // Skip unparseable lines (keep-alives, vendor extras)
        Err(_) => return Vec::new(),
    };
    if let Some(err) = resp.error {
        return vec![StreamChunk::Error(format!("openai stream error: {}", err.message))];
    }

    let mut chunks = Vec::new();
    if let Some(choice) = resp.choices.into_iter().next() {
        let reasoning = choice.delta.reasoning_content.or(choice.delta.reasoning);
        if let Some(reasoning) = reasoning.filter(|r| !r.is_empty()) {
            chunks.push(StreamChunk::Reasoning(reasoning));
        }
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            chunks.push(StreamChunk::Text(content));
        }
        if let Some(reason) = choice.finish_reason {
            chunks.push(StreamChunk::Done {
                stop_reason: Some(reason),
            });
        }
    }
    chunks
}

// ── Client ───────────────────────────────────────────────────────────

/// Client for any OpenAI-compatible chat completions endpoint.
pub struct OpenAIClient {
    http: Client,
    auth_token: String,
    model: String,
    base_url: String,
}

impl OpenAIClient {
    pub fn new(model: &str, api_key: Option<&str>, base_url: Option<&str>) -> Result<Self> {
        let auth_token = match api_key {
            Some(key) => key.to_string(),
            // Try environment variable as fallback
            None => env::var("OPENAI_API_KEY")
                .map_err(|_| anyhow!("No OpenAI authentication configured"))?,
        };

        Ok(Self {
            http: SHARED_HTTP.clone(),
            auth_token,
            model: model.to_string(),
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    async fn post(&self, messages: &[ChatMessage], stream: bool) -> Result<reqwest::Response> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let req = OpenAIRequest {
            model: &self.model,
            messages,
            stream: stream.then_some(true),
        };
        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.auth_token))
            .header("Content-Type", "application/json")
            .json(&req)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(error_detail("openai", status, &body));
        }
        Ok(resp)
    }

    pub async fn generate(&self, messages: &[ChatMessage]) -> Result<String> {
        let resp = self.post(messages, false).await?;
        let body: OpenAIResponse = resp.json().await?;
        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        Ok(text)
    }

    /// Stream the answer into `tx`.
    ///
    /// Returns `Err` if the connection fails before streaming starts. Once
    /// streaming has begun, failures go out as `StreamChunk::Error` and the
    /// method returns `Ok(None)`.
    pub async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        tx: &UnboundedSender<StreamChunk>,
    ) -> Result<Option<String>> {
        let resp = self.post(messages, true).await?;
        crate::sse::pump(resp, tx, decode_stream_data).await
    }
}
