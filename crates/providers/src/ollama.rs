use anyhow::{anyhow, Result};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::agent_api::{ChatMessage, StreamChunk};
use std::env;
use tokio::sync::mpsc::UnboundedSender;

use crate::{StreamSink, SHARED_HTTP};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
}

/// Streaming response: each line is one of these JSON objects.
#[derive(Debug, Deserialize)]
struct OllamaStreamLine {
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
}

fn decode_line(line: &str) -> Vec<StreamChunk> {
    let parsed = match serde_json::from_str::<OllamaStreamLine>(line) {
        Ok(parsed) => parsed,
        Err(e) => {
            return vec![StreamChunk::Error(format!(
                "Failed to parse Ollama stream: {}",
                e
            ))]
        }
    };
    if let Some(error) = parsed.error {
        return vec![StreamChunk::Error(format!("ollama error: {}", error))];
    }

    let mut chunks = Vec::new();
    if let Some(msg) = parsed.message {
        if let Some(thinking) = msg.thinking.filter(|t| !t.is_empty()) {
            chunks.push(StreamChunk::Reasoning(thinking));
        }
        if !msg.content.is_empty() {
            chunks.push(StreamChunk::Text(msg.content));
        }
    }
    if parsed.done {
        chunks.push(StreamChunk::Done { stop_reason: None });
    }
    chunks
}

pub struct OllamaClient {
    http: Client,
    base: String,
    model: String,
}

impl OllamaClient {
    pub fn new(model: &str, base_url: Option<&str>) -> Self {
        let base = match base_url {
            Some(url) => url.to_string(),
            None => env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
        };
        Self {
            http: SHARED_HTTP.clone(),
            base: base.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    async fn post(&self, messages: &[ChatMessage], stream: bool) -> Result<reqwest::Response> {
        let url = format!("{}/api/chat", self.base);
        let req = OllamaChatRequest {
            model: &self.model,
            messages,
            stream,
        };
        let resp = self.http.post(url).json(&req).send().await?;
        if !resp.status().is_success() {
            return Err(anyhow!("ollama error: {}", resp.status()));
        }
        Ok(resp)
    }

    pub async fn generate(&self, messages: &[ChatMessage]) -> Result<String> {
        let resp = self.post(messages, false).await?;
        let body: OllamaChatResponse = resp.json().await?;
        Ok(body.message.content)
    }

    pub async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        tx: &UnboundedSender<StreamChunk>,
    ) -> Result<Option<String>> {
        let resp = self.post(messages, true).await?;

        // One JSON object per line. Bytes wait for their newline so a
        // multi-byte char split across reads stays whole.
        let mut body = resp.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();
        let mut sink = StreamSink::new(tx);

        while let Some(read) = body.next().await {
            match read {
                Ok(bytes) => pending.extend_from_slice(&bytes),
                Err(e) => {
                    sink.forward(StreamChunk::Error(format!("stream read error: {}", e)));
                    return Ok(None);
                }
            }
            while let Some(end) = pending.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = pending.drain(..=end).collect();
                let line = String::from_utf8_lossy(&raw);
                if line.trim().is_empty() {
                    continue;
                }
                for chunk in decode_line(line.trim()) {
                    if let Some(outcome) = sink.forward(chunk) {
                        return Ok(outcome);
                    }
                }
            }
        }

        Ok(sink.finish())
    }
}
