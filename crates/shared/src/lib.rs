pub mod conversation;
pub mod error;
pub mod events;

pub mod settings {
    use serde::{Deserialize, Serialize};

    fn default_true() -> bool {
        true
    }

    /// Which wire protocol a profile speaks
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum ProviderKind {
        /// Any OpenAI-compatible `/v1/chat/completions` endpoint
        OpenAi,
        Anthropic,
        /// Local Ollama daemon
        Ollama,
    }

    impl ProviderKind {
        pub fn as_str(&self) -> &'static str {
            match self {
                ProviderKind::OpenAi => "openai",
                ProviderKind::Anthropic => "anthropic",
                ProviderKind::Ollama => "ollama",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ModelInfo {
        pub id: String,   // e.g., "gpt-4o-mini"
        pub name: String, // display name
    }

    /// One configured endpoint with its credentials and model list
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Profile {
        pub id: String,
        pub name: String,
        pub provider: ProviderKind,
        #[serde(default)]
        pub base_url: Option<String>,
        /// Falls back to the provider's env var when absent
        #[serde(default)]
        pub api_key: Option<String>,
        #[serde(default = "default_true")]
        pub enabled: bool,
        #[serde(default)]
        pub models: Vec<ModelInfo>,
    }

    impl Profile {
        pub fn model(&self, model_id: &str) -> Option<&ModelInfo> {
            self.models.iter().find(|m| m.id == model_id)
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct GatewaySettings {
        #[serde(default)]
        pub profiles: Vec<Profile>,
        /// Selection key in the form `<profile id>/<model id>`
        #[serde(default)]
        pub selected_model: Option<String>,
        #[serde(default = "default_true")]
        pub stream: bool,
        #[serde(default)]
        pub system_prompt: Option<String>,
        /// Upper bound on non-system messages sent upstream
        #[serde(default)]
        pub max_context_messages: Option<usize>,
    }

    impl GatewaySettings {
        pub fn profile(&self, profile_id: &str) -> Option<&Profile> {
            self.profiles.iter().find(|p| p.id == profile_id)
        }
    }

    /// Split a selection key into `(profile id, model id)`.
    ///
    /// Only the first `/` separates; model ids such as `meta-llama/Llama-3`
    /// keep their own slashes.
    pub fn split_selection_key(key: &str) -> Option<(&str, &str)> {
        let (profile_id, model_id) = key.split_once('/')?;
        if profile_id.is_empty() || model_id.is_empty() {
            return None;
        }
        Some((profile_id, model_id))
    }

    impl Default for GatewaySettings {
        fn default() -> Self {
            Self {
                profiles: vec![Profile {
                    id: "local".into(),
                    name: "Ollama (local)".into(),
                    provider: ProviderKind::Ollama,
                    base_url: None,
                    api_key: None,
                    enabled: true,
                    models: vec![ModelInfo {
                        id: "llama3.2:3b".into(),
                        name: "Llama 3.2 3B".into(),
                    }],
                }],
                selected_model: Some("local/llama3.2:3b".into()),
                stream: true,
                system_prompt: None,
                max_context_messages: None,
            }
        }
    }
}

pub mod agent_api {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ChatMessage {
        pub role: String, // "system" | "user" | "assistant"
        pub content: String,
    }

    impl ChatMessage {
        pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
            Self {
                role: role.into(),
                content: content.into(),
            }
        }
    }

    /// One item of an upstream response stream, delivered in arrival order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum StreamChunk {
        /// Answer text delta
        Text(String),
        /// Reasoning/thinking text delta, kept out of the answer body
        Reasoning(String),
        Done { stop_reason: Option<String> },
        /// Mid-stream failure, already reported by the provider
        Error(String),
    }
}
