//! Server-Sent Events decoding for streaming chat endpoints

use anyhow::Result;
use futures::StreamExt;
use shared::agent_api::StreamChunk;
use tokio::sync::mpsc::UnboundedSender;

use crate::StreamSink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field (Anthropic names every event; OpenAI never does)
    pub name: Option<String>,
    /// `data:` lines, newline-joined
    pub data: String,
}

/// Line-oriented decoder. Bytes are held until a full line arrives, so a
/// UTF-8 sequence or a `\r\n` split between network reads decodes intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    name: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events completed by `bytes`, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.take_line(line) {
                out.push(event);
            }
        }
        out
    }

    /// End of body: dispatch whatever was left without a blank line.
    pub fn flush(&mut self) -> Option<SseEvent> {
        if !self.pending.is_empty() {
            let raw = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
            if let Some(event) = self.take_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn take_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.name = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {} // id / retry
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let name = self.name.take();
        if self.data.is_empty() {
            return None;
        }
        Some(SseEvent {
            name,
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

/// Drain an SSE response body through `decode` into `tx`.
///
/// Read errors after the body started are reported in-band and yield
/// `Ok(None)`, like any other mid-stream failure.
pub(crate) async fn pump<F>(
    resp: reqwest::Response,
    tx: &UnboundedSender<StreamChunk>,
    decode: F,
) -> Result<Option<String>>
where
    F: Fn(&str) -> Vec<StreamChunk>,
{
    let mut decoder = SseDecoder::new();
    let mut sink = StreamSink::new(tx);
    let mut body = resp.bytes_stream();

    while let Some(read) = body.next().await {
        let bytes = match read {
            Ok(bytes) => bytes,
            Err(e) => {
                sink.forward(StreamChunk::Error(format!("stream read error: {}", e)));
                return Ok(None);
            }
        };
        for event in decoder.push(&bytes) {
            for chunk in decode(&event.data) {
                if let Some(outcome) = sink.forward(chunk) {
                    return Ok(outcome);
                }
            }
        }
    }

    if let Some(event) = decoder.flush() {
        for chunk in decode(&event.data) {
            if let Some(outcome) = sink.forward(chunk) {
                return Ok(outcome);
            }
        }
    }
    Ok(sink.finish())
}
