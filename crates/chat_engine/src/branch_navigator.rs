//! Branch queries and selection memory
//!
//! Everything here reads the tree, except `update_selection_memory`, which
//! writes `last_selected_child_id` along one ancestor chain.

use shared::conversation::{NodeId, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiblingDirection {
    Prev,
    Next,
}

/// Remember, at every ancestor of `node_id`, which child leads back to it.
pub fn update_selection_memory(session: &mut Session, node_id: &str) {
    let mut current = node_id.to_string();
    // Bounded walk: a corrupt parent cycle cannot spin forever
    for _ in 0..session.nodes.len() {
        let Some(parent_id) = session.node(&current).and_then(|n| n.parent_id.clone()) else {
            return;
        };
        let Some(parent) = session.node_mut(&parent_id) else {
            return;
        };
        if parent.children_ids.contains(&current) {
            parent.last_selected_child_id = Some(current);
        }
        current = parent_id;
    }
}

/// Descend from `node_id` to a leaf, following remembered choices and
/// otherwise the newest child.
pub fn find_leaf_of_branch(session: &Session, node_id: &str) -> NodeId {
    let mut current = node_id.to_string();
    for _ in 0..session.nodes.len() {
        let Some(node) = session.node(&current) else {
            break;
        };
        let remembered = node
            .last_selected_child_id
            .as_ref()
            .filter(|id| node.children_ids.contains(id) && session.contains(id));
        match remembered.or_else(|| node.children_ids.last()) {
            Some(next) => current = next.clone(),
            None => break,
        }
    }
    current
}

/// Step to the previous/next sibling and land on that branch's leaf.
///
/// Returns `node_id` unchanged for the root, unknown nodes, and at either end
/// of the sibling list (no wrap-around).
pub fn switch_to_sibling(session: &Session, node_id: &str, direction: SiblingDirection) -> NodeId {
    let Some(parent) = session
        .node(node_id)
        .and_then(|n| n.parent_id.as_deref())
        .and_then(|p| session.node(p))
    else {
        return node_id.to_string();
    };
    let Some(index) = parent.children_ids.iter().position(|c| c == node_id) else {
        return node_id.to_string();
    };

    let target = match direction {
        SiblingDirection::Prev => index.checked_sub(1),
        SiblingDirection::Next => Some(index + 1).filter(|i| *i < parent.children_ids.len()),
    };
    match target {
        Some(i) => find_leaf_of_branch(session, &parent.children_ids[i]),
        None => node_id.to_string(),
    }
}

/// Ids from the root down to `node_id`, inclusive. Empty if unknown.
pub fn path_to(session: &Session, node_id: &str) -> Vec<NodeId> {
    let mut path = Vec::new();
    let mut current = session.node(node_id);
    while let Some(node) = current {
        if path.len() > session.nodes.len() {
            break;
        }
        path.push(node.id.clone());
        current = node.parent_id.as_deref().and_then(|p| session.node(p));
    }
    path.reverse();
    path
}

/// Root to active leaf
pub fn active_path(session: &Session) -> Vec<NodeId> {
    path_to(session, &session.active_leaf_id)
}

/// Zero-based position among siblings and the sibling count, for "2 / 3"
/// indicators. `None` for the root or unknown nodes.
pub fn sibling_position(session: &Session, node_id: &str) -> Option<(usize, usize)> {
    let parent_id = session.node(node_id)?.parent_id.as_deref()?;
    let siblings = &session.node(parent_id)?.children_ids;
    let index = siblings.iter().position(|c| c == node_id)?;
    Some((index, siblings.len()))
}
