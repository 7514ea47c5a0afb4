use crate::anthropic::AnthropicClient;
use crate::ollama::OllamaClient;
use crate::openai::OpenAIClient;
use crate::{ChatRequest, ChatResponse, ChatTransport};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::agent_api::{ChatMessage, StreamChunk};
use shared::settings::{GatewaySettings, Profile, ProviderKind};
use tokio::sync::mpsc::UnboundedSender;

/// Routes each request to the client for its profile's provider kind.
pub struct ProviderRouter {
    config: GatewaySettings,
}

impl ProviderRouter {
    pub fn new(config: GatewaySettings) -> Self {
        Self { config }
    }

    fn profile(&self, profile_id: &str) -> Result<&Profile> {
        self.config
            .profile(profile_id)
            .ok_or_else(|| anyhow!("Unknown profile: {}", profile_id))
    }

    pub async fn generate(
        &self,
        profile: &Profile,
        model_id: &str,
        messages: &[ChatMessage],
    ) -> Result<String> {
        let base_url = profile.base_url.as_deref();
        let api_key = profile.api_key.as_deref();
        match profile.provider {
            ProviderKind::Ollama => OllamaClient::new(model_id, base_url).generate(messages).await,
            ProviderKind::OpenAi => {
                OpenAIClient::new(model_id, api_key, base_url)?
                    .generate(messages)
                    .await
            }
            ProviderKind::Anthropic => {
                AnthropicClient::new(model_id, api_key, base_url)?
                    .generate(messages)
                    .await
            }
        }
    }

    /// Streaming generation.
    ///
    /// Contract: if the HTTP connection fails *before* any chunks are sent,
    /// returns `Err(...)`. Once streaming starts, errors go through
    /// `StreamChunk::Error` and the method returns `Ok(None)`.
    pub async fn generate_stream(
        &self,
        profile: &Profile,
        model_id: &str,
        messages: &[ChatMessage],
        tx: &UnboundedSender<StreamChunk>,
    ) -> Result<Option<String>> {
        let base_url = profile.base_url.as_deref();
        let api_key = profile.api_key.as_deref();
        match profile.provider {
            ProviderKind::Ollama => {
                OllamaClient::new(model_id, base_url)
                    .generate_stream(messages, tx)
                    .await
            }
            ProviderKind::OpenAi => {
                OpenAIClient::new(model_id, api_key, base_url)?
                    .generate_stream(messages, tx)
                    .await
            }
            ProviderKind::Anthropic => {
                AnthropicClient::new(model_id, api_key, base_url)?
                    .generate_stream(messages, tx)
                    .await
            }
        }
    }
}

#[async_trait]
impl ChatTransport for ProviderRouter {
    async fn send_request(
        &self,
        request: ChatRequest,
        tx: UnboundedSender<StreamChunk>,
    ) -> Result<Option<ChatResponse>> {
        let profile = self.profile(&request.profile_id)?;
        tracing::debug!(
            profile = %profile.id,
            provider = profile.provider.as_str(),
            model = %request.model_id,
            messages = request.messages.len(),
            stream = request.stream,
            "sending chat request"
        );

        if !request.stream {
            let content = self
                .generate(profile, &request.model_id, &request.messages)
                .await?;
            return Ok(Some(ChatResponse {
                content,
                is_stream: false,
            }));
        }

        let outcome = self
            .generate_stream(profile, &request.model_id, &request.messages, &tx)
            .await?;
        Ok(outcome.map(|content| ChatResponse {
            content,
            is_stream: true,
        }))
    }
}
