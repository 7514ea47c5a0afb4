//! Conversation tree types.
//!
//! A `Session` owns every `Node` through its `nodes` map. Nodes refer to each
//! other by id only, so the tree is an arena: re-parenting, cascading deletes
//! and branch switches are table edits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

pub type NodeId = String;

pub const DEFAULT_SESSION_NAME: &str = "New conversation";

/// Error recorded on a turn whose generation never settled
pub const INTERRUPTED_MESSAGE: &str = "Generation interrupted";

/// Longest auto-generated session title, in chars
const TITLE_MAX_CHARS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    System,
    User,
    Assistant,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::System => "system",
            NodeRole::User => "user",
            NodeRole::Assistant => "assistant",
        }
    }
}

/// Generation status: `Pending -> Generating -> {Complete, Error}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Placeholder not yet submitted
    Pending,
    Generating,
    Complete,
    Error,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Complete | NodeStatus::Error)
    }
}

/// Data the tree engine carries but never interprets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// One message plus its tree linkage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    /// `None` exactly for the root
    pub parent_id: Option<NodeId>,
    /// Creation order; the last entry is the newest answer attempt
    #[serde(default)]
    pub children_ids: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_selected_child_id: Option<NodeId>,
    pub content: String,
    pub role: NodeRole,
    pub status: NodeStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: NodeMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Node {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.children_ids.is_empty()
    }
}

/// One conversation: a single-rooted tree of nodes plus the active position.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub root_node_id: NodeId,
    pub nodes: HashMap<NodeId, Node>,
    pub active_leaf_id: NodeId,
    #[serde(default)]
    pub display_agent_id: Option<String>,
}

impl Session {
    /// Create a session holding only its system root.
    pub fn new(name: impl Into<String>, system_prompt: Option<&str>) -> Self {
        let now = Utc::now();
        let root = Node {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            children_ids: Vec::new(),
            last_selected_child_id: None,
            content: system_prompt.unwrap_or_default().to_string(),
            role: NodeRole::System,
            status: NodeStatus::Complete,
            timestamp: now,
            metadata: NodeMetadata::default(),
            name: None,
        };
        let root_id = root.id.clone();
        let mut nodes = HashMap::new();
        nodes.insert(root_id.clone(), root);

        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            created_at: now,
            updated_at: now,
            root_node_id: root_id.clone(),
            nodes,
            active_leaf_id: root_id,
            display_agent_id: None,
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn root(&self) -> Option<&Node> {
        self.nodes.get(&self.root_node_id)
    }

    pub fn active_leaf(&self) -> Option<&Node> {
        self.nodes.get(&self.active_leaf_id)
    }

    /// Node count excluding the root
    pub fn message_count(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Name the session after its first user message, once.
    pub fn auto_title(&mut self, user_content: &str) {
        if self.name != DEFAULT_SESSION_NAME {
            return;
        }
        let trimmed = user_content.trim();
        if trimmed.is_empty() {
            return;
        }
        let mut title: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
        title = title.trim().to_string();
        if trimmed.chars().count() > TITLE_MAX_CHARS {
            title.push_str("...");
        }
        self.name = title;
    }

    /// List every broken structural rule. Empty means well-formed.
    pub fn integrity_violations(&self) -> Vec<String> {
        let mut problems = Vec::new();

        let roots: Vec<&Node> = self.nodes.values().filter(|n| n.is_root()).collect();
        if roots.len() != 1 {
            problems.push(format!("expected exactly one root, found {}", roots.len()));
        }
        match self.nodes.get(&self.root_node_id) {
            Some(root) if !root.is_root() => {
                problems.push(format!("root {} has a parent", root.id));
            }
            None => problems.push(format!("root {} missing", self.root_node_id)),
            _ => {}
        }
        if !self.nodes.contains_key(&self.active_leaf_id) {
            problems.push(format!("active leaf {} missing", self.active_leaf_id));
        }

        for node in self.nodes.values() {
            if let Some(parent_id) = &node.parent_id {
                match self.nodes.get(parent_id) {
                    None => problems.push(format!("{} has dangling parent {}", node.id, parent_id)),
                    Some(parent) => {
                        let edges = parent.children_ids.iter().filter(|c| *c == &node.id).count();
                        if edges != 1 {
                            problems.push(format!(
                                "{} listed {} times under parent {}",
                                node.id, edges, parent_id
                            ));
                        }
                    }
                }
            }
            let mut seen = HashSet::new();
            for child_id in &node.children_ids {
                if !seen.insert(child_id) {
                    continue;
                }
                match self.nodes.get(child_id) {
                    Some(child) if child.parent_id.as_deref() == Some(node.id.as_str()) => {}
                    _ => problems.push(format!("{} lists foreign child {}", node.id, child_id)),
                }
            }
            if let Some(selected) = &node.last_selected_child_id {
                if !node.children_ids.contains(selected) {
                    problems.push(format!("{} remembers non-child {}", node.id, selected));
                }
            }
        }

        problems
    }

    pub fn is_well_formed(&self) -> bool {
        self.integrity_violations().is_empty()
    }

    /// Mark every node still `Generating` as failed, keeping partial content.
    /// Returns how many were settled.
    pub fn settle_interrupted(&mut self) -> usize {
        let mut settled = 0;
        for node in self.nodes.values_mut() {
            if node.status == NodeStatus::Generating {
                node.status = NodeStatus::Error;
                node.metadata
                    .error
                    .get_or_insert_with(|| INTERRUPTED_MESSAGE.to_string());
                settled += 1;
            }
        }
        settled
    }
}

/// Index entry for session lists, avoiding a full body load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
    #[serde(default)]
    pub display_agent_id: Option<String>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            name: session.name.clone(),
            updated_at: session.updated_at,
            created_at: session.created_at,
            message_count: session.message_count(),
            display_agent_id: session.display_agent_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIndex {
    #[serde(default)]
    pub active_session_id: Option<String>,
    #[serde(default)]
    pub sessions: Vec<SessionSummary>,
}

impl SessionIndex {
    pub fn upsert(&mut self, summary: SessionSummary) {
        match self.sessions.iter_mut().find(|s| s.id == summary.id) {
            Some(existing) => *existing = summary,
            None => self.sessions.push(summary),
        }
        self.sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|s| s.id != id);
        if self.active_session_id.as_deref() == Some(id) {
            self.active_session_id = None;
        }
        self.sessions.len() != before
    }
}
