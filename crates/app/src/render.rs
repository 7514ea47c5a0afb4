//! Plain-text views of a session

use chat_engine::branch_navigator::{active_path, sibling_position};
use shared::conversation::{Node, NodeId, NodeRole, NodeStatus, Session};
use std::collections::HashSet;

const PREVIEW_CHARS: usize = 60;

fn speaker(node: &Node) -> String {
    match node.role {
        NodeRole::System => "system".to_string(),
        NodeRole::User => "you".to_string(),
        NodeRole::Assistant => match &node.metadata.model_name {
            Some(model) => format!("assistant ({})", model),
            None => "assistant".to_string(),
        },
    }
}

fn branch_marker(session: &Session, node: &Node) -> String {
    match sibling_position(session, &node.id) {
        Some((index, count)) if count > 1 => format!(" [{}/{}]", index + 1, count),
        _ => String::new(),
    }
}

fn status_marker(node: &Node) -> String {
    match node.status {
        NodeStatus::Error => match &node.metadata.error {
            Some(error) => format!(" !! {}", error),
            None => " !!".to_string(),
        },
        NodeStatus::Generating => " ...".to_string(),
        NodeStatus::Pending | NodeStatus::Complete => String::new(),
    }
}

fn preview(content: &str) -> String {
    let line = content.lines().next().unwrap_or("").trim();
    let mut short: String = line.chars().take(PREVIEW_CHARS).collect();
    if line.chars().count() > PREVIEW_CHARS || content.lines().nth(1).is_some() {
        short.push_str("...");
    }
    short
}

/// The active branch as a chat log.
pub fn transcript(session: &Session) -> String {
    let mut out = String::new();
    for id in active_path(session) {
        let Some(node) = session.node(&id) else {
            continue;
        };
        if node.is_root() && node.content.trim().is_empty() {
            continue;
        }
        out.push_str(&format!(
            "{}{}{}:\n{}\n\n",
            speaker(node),
            branch_marker(session, node),
            status_marker(node),
            node.content
        ));
    }
    out
}

/// Indented outline of every branch. `*` marks the active path.
pub fn tree(session: &Session) -> String {
    let on_path: HashSet<NodeId> = active_path(session).into_iter().collect();
    let mut out = String::new();
    let mut stack = vec![(session.root_node_id.clone(), 0usize)];

    while let Some((id, depth)) = stack.pop() {
        let Some(node) = session.node(&id) else {
            continue;
        };
        let marker = if on_path.contains(&id) { '*' } else { ' ' };
        let label = if node.is_root() {
            "(root)".to_string()
        } else {
            format!("{}: {}", speaker(node), preview(&node.content))
        };
        out.push_str(&format!(
            "{} {}{}{}\n",
            marker,
            "  ".repeat(depth),
            label,
            status_marker(node)
        ));
        for child in node.children_ids.iter().rev() {
            stack.push((child.clone(), depth + 1));
        }
    }
    out
}

/// Deepest node on the active path that has sibling answers to flip through.
pub fn branch_point(session: &Session) -> Option<NodeId> {
    active_path(session)
        .into_iter()
        .rev()
        .find(|id| matches!(sibling_position(session, id), Some((_, count)) if count > 1))
}

/// Most recent user turn on the active path.
pub fn last_user_turn(session: &Session) -> Option<NodeId> {
    active_path(session)
        .into_iter()
        .rev()
        .find(|id| session.node(id).map(|n| n.role == NodeRole::User).unwrap_or(false))
}
