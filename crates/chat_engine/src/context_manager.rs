//! Active path -> outbound message list
//!
//! The executor hands over the nodes from the root down to the anchor. The
//! pipeline decides which of them the model gets to see.

use chrono::{DateTime, Local};
use regex::Regex;
use shared::agent_api::ChatMessage;
use shared::conversation::{Node, NodeRole, NodeStatus};
use shared::settings::GatewaySettings;
use std::sync::LazyLock;

static MACRO_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\{\{\s*(date|time|datetime)\s*\}\}").ok());

pub trait ContextPipeline: Send + Sync {
    fn build_context(&self, active_path: &[Node]) -> Vec<ChatMessage>;
}

#[derive(Debug, Clone, Default)]
pub struct DefaultContextPipeline {
    /// Used when the session root carries no prompt of its own
    pub system_prompt: Option<String>,
    /// Upper bound on non-system messages; oldest turns go first
    pub max_context_messages: Option<usize>,
}

impl DefaultContextPipeline {
    pub fn from_settings(settings: &GatewaySettings) -> Self {
        Self {
            system_prompt: settings.system_prompt.clone(),
            max_context_messages: settings.max_context_messages,
        }
    }

    pub fn build_context_at(&self, active_path: &[Node], now: DateTime<Local>) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(active_path.len() + 1);

        let root_has_prompt = active_path
            .first()
            .map(|n| n.role == NodeRole::System && !n.content.trim().is_empty())
            .unwrap_or(false);
        if !root_has_prompt {
            if let Some(prompt) = self.system_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
                messages.push(ChatMessage::new("system", expand_macros(prompt, now)));
            }
        }

        for node in active_path {
            match node.role {
                NodeRole::System if node.content.trim().is_empty() => continue,
                NodeRole::Assistant if node.status != NodeStatus::Complete => continue,
                NodeRole::Assistant => {
                    messages.push(ChatMessage::new("assistant", node.content.clone()));
                }
                NodeRole::System | NodeRole::User => {
                    messages.push(ChatMessage::new(
                        node.role.as_str(),
                        expand_macros(&node.content, now),
                    ));
                }
            }
        }

        match self.max_context_messages {
            Some(limit) => apply_window(messages, limit),
            None => messages,
        }
    }
}

impl ContextPipeline for DefaultContextPipeline {
    fn build_context(&self, active_path: &[Node]) -> Vec<ChatMessage> {
        self.build_context_at(active_path, Local::now())
    }
}

/// Replace `{{date}}`, `{{time}}` and `{{datetime}}`.
pub fn expand_macros(text: &str, now: DateTime<Local>) -> String {
    let Some(re) = MACRO_RE.as_ref() else {
        return text.to_string();
    };
    if !text.contains("{{") {
        return text.to_string();
    }
    re.replace_all(text, |caps: &regex::Captures| match &caps[1] {
        "date" => now.format("%Y-%m-%d").to_string(),
        "time" => now.format("%H:%M").to_string(),
        _ => now.format("%Y-%m-%d %H:%M").to_string(),
    })
    .into_owned()
}

/// Keep every system message plus the newest `limit` others, in order.
///
/// The kept non-system messages always start at a user turn; older assistant
/// turns left at the front of the window are dropped as well.
fn apply_window(messages: Vec<ChatMessage>, limit: usize) -> Vec<ChatMessage> {
    let others = messages.iter().filter(|m| m.role != "system").count();
    let mut skip = others.saturating_sub(limit);
    let mut seen_user = false;
    messages
        .into_iter()
        .filter(|m| {
            if m.role == "system" {
                return true;
            }
            if skip > 0 {
                skip -= 1;
                return false;
            }
            seen_user |= m.role == "user";
            seen_user
        })
        .collect()
}
