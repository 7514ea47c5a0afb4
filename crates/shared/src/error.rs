//! Error taxonomy for the conversation engine.

use crate::conversation::NodeId;

/// Model/profile selection failures. Raised before any tree mutation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("No model selected")]
    NoModelSelected,

    #[error("Profile not found: {profile_id}")]
    ProfileNotFound { profile_id: String },

    #[error("Profile {profile_id} is disabled")]
    ProfileDisabled { profile_id: String },

    #[error("Model {model_id} not found in profile {profile_id}")]
    ModelNotFound {
        profile_id: String,
        model_id: String,
    },
}

/// Refusals at the tree-mutation boundary. None of these mutate the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("Node not found: {node_id}")]
    NodeNotFound { node_id: NodeId },

    #[error("Root node {node_id} cannot be deleted")]
    RootProtected { node_id: NodeId },

    #[error("Malformed tree: {reason}")]
    MalformedTree { reason: String },
}

impl TreeError {
    pub fn not_found(node_id: &str) -> Self {
        TreeError::NodeNotFound {
            node_id: node_id.to_string(),
        }
    }
}
