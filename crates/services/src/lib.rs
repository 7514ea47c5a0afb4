//! Services - storage backing the chat engine
//!
//! Sessions are stored one JSON file each, next to a small index file so
//! session lists never have to load a conversation body.

pub mod session_store;

pub use session_store::{SessionPersistence, SessionStore};
