//! Chat engine - branching conversation trees driven by LLM generations
//!
//! - `node_manager`: the only code that creates, attaches or deletes nodes
//! - `branch_navigator`: leaf descent, sibling switching, selection memory
//! - `executor`: one user turn from utterance to settled assistant node
//! - `generation`: per-session single-writer guard with cancellation
//! - `profiles` / `context_manager`: model selection and prompt assembly

pub mod branch_navigator;
pub mod context_manager;
pub mod executor;
pub mod generation;
pub mod node_manager;
pub mod profiles;

use parking_lot::Mutex;
use shared::conversation::Session;
use std::sync::Arc;

pub use branch_navigator::SiblingDirection;
pub use context_manager::{ContextPipeline, DefaultContextPipeline};
pub use executor::{ChatExecutor, ExecuteOutcome, RegeneratePlan};
pub use generation::{GenerationRegistry, GenerationState};
pub use node_manager::{DeleteOutcome, NodeConfig};
pub use profiles::{ProfileResolver, ResolvedModel, SettingsProfileResolver};

/// A session shared between the executor and its front-end.
pub type SharedSession = Arc<Mutex<Session>>;

pub fn share(session: Session) -> SharedSession {
    Arc::new(Mutex::new(session))
}
