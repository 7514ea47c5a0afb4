//! Generation events for front-ends rendering a live stream.

use serde::{Deserialize, Serialize};

use crate::conversation::{NodeId, NodeStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatEvent {
    /// Assistant placeholder attached and made active
    Started { session_id: String, node_id: NodeId },
    /// Text appended to the assistant node
    Delta {
        session_id: String,
        node_id: NodeId,
        text: String,
    },
    /// Node reached a terminal status
    Finished {
        session_id: String,
        node_id: NodeId,
        status: NodeStatus,
    },
}
