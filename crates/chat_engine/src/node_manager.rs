//! Invariant-preserving tree mutations
//!
//! These primitives are the only code that creates, attaches or destroys
//! nodes. They know nothing about networking or persistence.

use chrono::Utc;
use shared::conversation::{Node, NodeId, NodeMetadata, NodeRole, NodeStatus, Session};
use shared::error::TreeError;
use std::collections::HashSet;
use uuid::Uuid;

use crate::branch_navigator;

/// Construction parameters for `create_node`
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub role: NodeRole,
    pub content: String,
    pub parent_id: Option<NodeId>,
    /// Defaults to `Complete`
    pub status: Option<NodeStatus>,
    pub metadata: Option<NodeMetadata>,
    pub name: Option<String>,
}

impl NodeConfig {
    pub fn new(role: NodeRole, content: impl Into<String>, parent_id: Option<NodeId>) -> Self {
        Self {
            role,
            content: content.into(),
            parent_id,
            status: None,
            metadata: None,
            name: None,
        }
    }

    pub fn status(mut self, status: NodeStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn metadata(mut self, metadata: NodeMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Result of a cascading delete
#[derive(Debug, Clone, Default)]
pub struct DeleteOutcome {
    pub success: bool,
    /// Detached copies of every removed node, for external cleanup
    pub deleted_nodes: Vec<Node>,
}

/// Build a detached node with a fresh id. Touches no session.
pub fn create_node(config: NodeConfig) -> Node {
    Node {
        id: Uuid::new_v4().to_string(),
        parent_id: config.parent_id,
        children_ids: Vec::new(),
        last_selected_child_id: None,
        content: config.content,
        role: config.role,
        status: config.status.unwrap_or(NodeStatus::Complete),
        timestamp: Utc::now(),
        metadata: config.metadata.unwrap_or_default(),
        name: config.name,
    }
}

/// Insert `node` and link it under its parent. Attaching twice is harmless.
///
/// Refuses (returns false, no mutation) a node whose parent is not in the
/// session, and a second parentless node. An id already in the session is
/// left as stored: true if `node` names the same parent, false otherwise.
pub fn add_node_to_session(session: &mut Session, node: Node) -> bool {
    if let Some(existing) = session.node(&node.id) {
        if existing.parent_id != node.parent_id {
            tracing::warn!(node = %node.id, "refusing to re-parent existing node");
            return false;
        }
        return true;
    }
    match &node.parent_id {
        Some(parent_id) => match session.node_mut(parent_id) {
            Some(parent) => {
                if !parent.children_ids.contains(&node.id) {
                    parent.children_ids.push(node.id.clone());
                }
            }
            None => {
                tracing::warn!(node = %node.id, parent = %parent_id, "refusing node with missing parent");
                return false;
            }
        },
        None if node.id != session.root_node_id => {
            tracing::warn!(node = %node.id, "refusing second root");
            return false;
        }
        None => {}
    }
    tracing::debug!(node = %node.id, role = node.role.as_str(), "attached node");
    session.nodes.insert(node.id.clone(), node);
    true
}

/// Move the active leaf to `node_id` and remember the path leading there.
///
/// Returns false without touching the session if the node does not exist.
pub fn update_active_leaf(session: &mut Session, node_id: &str) -> bool {
    if !session.contains(node_id) {
        tracing::debug!(node = %node_id, "active leaf target not found");
        return false;
    }
    session.active_leaf_id = node_id.to_string();
    session.touch();
    branch_navigator::update_selection_memory(session, node_id);
    true
}

/// Cascading delete with the non-throwing contract.
pub fn hard_delete_node(session: &mut Session, node_id: &str) -> DeleteOutcome {
    match try_hard_delete_node(session, node_id) {
        Ok(deleted_nodes) => DeleteOutcome {
            success: true,
            deleted_nodes,
        },
        Err(e) => {
            tracing::info!(node = %node_id, error = %e, "delete refused");
            DeleteOutcome::default()
        }
    }
}

/// Remove `node_id` and its whole subtree.
///
/// If the active leaf is inside the removed subtree it moves to, in order:
/// the remembered leaf of the first remaining sibling, the parent, the root.
pub fn try_hard_delete_node(session: &mut Session, node_id: &str) -> Result<Vec<Node>, TreeError> {
    let node = session
        .node(node_id)
        .ok_or_else(|| TreeError::not_found(node_id))?;
    if node_id == session.root_node_id || node.is_root() {
        return Err(TreeError::RootProtected {
            node_id: node_id.to_string(),
        });
    }
    let parent_id = node.parent_id.clone();

    let doomed = collect_subtree(session, node_id);
    let doomed_set: HashSet<&str> = doomed.iter().map(String::as_str).collect();

    let next_active = if doomed_set.contains(session.active_leaf_id.as_str()) {
        let sibling = parent_id
            .as_deref()
            .and_then(|p| session.node(p))
            .and_then(|parent| parent.children_ids.iter().find(|c| c.as_str() != node_id))
            .cloned();
        Some(match sibling {
            Some(sibling) => branch_navigator::find_leaf_of_branch(session, &sibling),
            None => parent_id
                .clone()
                .filter(|p| session.contains(p))
                .unwrap_or_else(|| session.root_node_id.clone()),
        })
    } else {
        None
    };

    if let Some(parent) = parent_id.as_deref().and_then(|p| session.node_mut(p)) {
        parent.children_ids.retain(|c| c != node_id);
        if parent.last_selected_child_id.as_deref() == Some(node_id) {
            parent.last_selected_child_id = None;
        }
    }

    let deleted: Vec<Node> = doomed
        .iter()
        .filter_map(|id| session.nodes.remove(id))
        .collect();

    if let Some(next_active) = next_active {
        session.active_leaf_id = next_active.clone();
        branch_navigator::update_selection_memory(session, &next_active);
    }
    session.touch();

    tracing::info!(node = %node_id, removed = deleted.len(), "deleted subtree");
    Ok(deleted)
}

/// `node_id` plus every descendant, found with an explicit worklist.
fn collect_subtree(session: &Session, node_id: &str) -> Vec<NodeId> {
    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![node_id.to_string()];

    while let Some(id) = stack.pop() {
        if !seen.insert(id.clone()) {
            continue;
        }
        if let Some(node) = session.node(&id) {
            stack.extend(node.children_ids.iter().cloned());
        }
        order.push(id);
    }
    order
}
