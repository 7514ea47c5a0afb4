use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::agent_api::{ChatMessage, StreamChunk};
use std::env;
use tokio::sync::mpsc::UnboundedSender;

use crate::{error_detail, SHARED_HTTP};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const MAX_TOKENS: i32 = 4096;

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: Option<AnthropicDelta>,
    #[serde(default)]
    error: Option<AnthropicError>,
}

#[derive(Debug, Deserialize)]
struct AnthropicDelta {
    #[serde(rename = "type", default)]
    delta_type: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(default)]
    message: String,
}

/// Anthropic takes system text as a top-level field, not as a message.
fn split_system(messages: &[ChatMessage]) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system_prompt = String::new();
    let mut anthropic_messages: Vec<AnthropicMessage> = Vec::new();
    for m in messages {
        if m.role == "system" {
            if !system_prompt.is_empty() {
                system_prompt.push_str("\n\n");
            }
            system_prompt.push_str(&m.content);
        } else {
            anthropic_messages.push(AnthropicMessage {
                role: m.role.clone(),
                content: m.content.clone(),
            });
        }
    }

    let system = if system_prompt.trim().is_empty() {
        None
    } else {
        Some(system_prompt)
    };
    (system, anthropic_messages)
}

fn decode_stream_event(data: &str) -> Vec<StreamChunk> {
    let event = match serde_json::from_str::<AnthropicStreamEvent>(data) {
        Ok(event) => event,
        Err(_) => return Vec::new(),
    };
    match event.event_type.as_str() {
        "content_block_delta" => {
            let Some(delta) = event.delta else {
                return Vec::new();
            };
            match delta.delta_type.as_deref() {
                Some("thinking_delta") => delta
                    .thinking
                    .filter(|t| !t.is_empty())
                    .map(StreamChunk::Reasoning)
                    .into_iter()
                    .collect(),
                _ => delta
                    .text
                    .filter(|t| !t.is_empty())
                    .map(StreamChunk::Text)
                    .into_iter()
                    .collect(),
            }
        }
        "message_delta" => event
            .delta
            .and_then(|d| d.stop_reason)
            .map(|reason| StreamChunk::Done {
                stop_reason: Some(reason),
            })
            .into_iter()
            .collect(),
        "message_stop" => vec![StreamChunk::Done { stop_reason: None }],
        "error" => {
            let message = event.error.map(|e| e.message).unwrap_or_default();
            vec![StreamChunk::Error(format!("anthropic stream error: {}", message))]
        }
        _ => Vec::new(),
    }
}

pub struct AnthropicClient {
    http: Client,
    auth_token: String,
    model: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(model: &str, api_key: Option<&str>, base_url: Option<&str>) -> Result<Self> {
        let auth_token = match api_key {
            Some(key) => key.to_string(),
            // Try environment variable as fallback
            None => env::var("ANTHROPIC_API_KEY")
                .map_err(|_| anyhow!("No Anthropic authentication configured"))?,
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
        let url = format!("{}/v1/messages", self.base_url);
        let (system, anthropic_messages) = split_system(messages);
        let req = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: MAX_TOKENS,
            system,
            messages: anthropic_messages,
            stream,
        };

        let resp = self
            .http
            .post(url)
            .header("x-api-key", &self.auth_token)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&req)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(error_detail("anthropic", status, &body));
        }
        Ok(resp)
    }

    pub async fn generate(&self, messages: &[ChatMessage]) -> Result<String> {
        let resp = self.post(messages, false).await?;
        let body: AnthropicResponse = resp.json().await?;
        let text = body
            .content
            .iter()
            .filter(|c| c.content_type == "text")
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("");
        Ok(text)
    }

    pub async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        tx: &UnboundedSender<StreamChunk>,
    ) -> Result<Option<String>> {
        let resp = self.post(messages, true).await?;
        crate::sse::pump(resp, tx, decode_stream_event).await
    }
}
