//! Providers - network layer between the chat engine and LLM endpoints
//!
//! Every client speaks the same contract: answer text either comes back whole
//! (non-streaming) or as an ordered series of `StreamChunk`s pushed into an
//! unbounded channel. All chunks for a request are sent before the request
//! future resolves.

pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod router;
pub mod sse;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use shared::agent_api::{ChatMessage, StreamChunk};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

pub use router::ProviderRouter;

pub(crate) static SHARED_HTTP: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(120))
        .pool_max_idle_per_host(2)
        .build()
        .expect("failed to build HTTP client")
});

/// Outbound request, already resolved to a concrete profile and model.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub profile_id: String,
    pub model_id: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatResponse {
    /// Full answer text (for streams, the concatenation of the text deltas)
    pub content: String,
    pub is_stream: bool,
}

/// The network seam the executor drives.
///
/// Contract:
/// - `Err(..)`: the request failed before producing output.
/// - `Ok(None)`: the request failed after the failure was already reported
///   through the channel as `StreamChunk::Error`; callers must not re-report it.
/// - `Ok(Some(..))`: finished.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_request(
        &self,
        request: ChatRequest,
        tx: UnboundedSender<StreamChunk>,
    ) -> Result<Option<ChatResponse>>;
}

/// Forwards decoded chunks to the caller while keeping the answer text.
pub(crate) struct StreamSink<'a> {
    tx: &'a UnboundedSender<StreamChunk>,
    text: String,
}

impl<'a> StreamSink<'a> {
    pub(crate) fn new(tx: &'a UnboundedSender<StreamChunk>) -> Self {
        Self {
            tx,
            text: String::new(),
        }
    }

    /// Returns `Some(outcome)` once the chunk ended the stream.
    /// The outcome is `None` when the stream ended in an error.
    pub(crate) fn forward(&mut self, chunk: StreamChunk) -> Option<Option<String>> {
        let ended = match &chunk {
            StreamChunk::Text(text) => {
                self.text.push_str(text);
                None
            }
            StreamChunk::Reasoning(_) => None,
            StreamChunk::Done { .. } => Some(Some(std::mem::take(&mut self.text))),
            StreamChunk::Error(_) => Some(None),
        };
        // A closed receiver means the consumer gave up; keep draining quietly.
        let _ = self.tx.send(chunk);
        ended
    }

    /// End of body without an explicit terminator.
    pub(crate) fn finish(mut self) -> Option<String> {
        let _ = self.tx.send(StreamChunk::Done { stop_reason: None });
        Some(std::mem::take(&mut self.text))
    }
}

/// Trim an error body to something loggable.
pub(crate) fn error_detail(provider: &str, status: reqwest::StatusCode, body: &str) -> anyhow::Error {
    let detail: String = body.chars().take(800).collect();
    if detail.trim().is_empty() {
        anyhow::anyhow!("{} error: {}", provider, status)
    } else {
        anyhow::anyhow!("{} error: {}\n{}", provider, status, detail)
    }
}
