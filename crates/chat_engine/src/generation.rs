//! Per-session single-writer guard for generations.
//!
//! A session is either `Idle` or `Generating` with the cancellation token of
//! the running generation. Claiming the session is one check-and-set under a
//! lock, and the returned guard puts the session back to `Idle` on drop.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub enum GenerationState {
    Idle,
    Generating(CancellationToken),
}

impl GenerationState {
    pub fn is_generating(&self) -> bool {
        matches!(self, GenerationState::Generating(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerationRegistry {
    running: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl GenerationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, session_id: &str) -> GenerationState {
        match self.running.lock().get(session_id) {
            Some(token) => GenerationState::Generating(token.clone()),
            None => GenerationState::Idle,
        }
    }

    /// Claim the session. `None` if a generation already holds it.
    pub fn try_begin(&self, session_id: &str) -> Option<GenerationGuard> {
        let mut running = self.running.lock();
        if running.contains_key(session_id) {
            return None;
        }
        let token = CancellationToken::new();
        running.insert(session_id.to_string(), token.clone());
        Some(GenerationGuard {
            running: Arc::clone(&self.running),
            session_id: session_id.to_string(),
            token,
        })
    }

    /// Signal the running generation to stop. False when idle.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.running.lock().get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Held for the lifetime of one generation
#[derive(Debug)]
pub struct GenerationGuard {
    running: Arc<Mutex<HashMap<String, CancellationToken>>>,
    session_id: String,
    token: CancellationToken,
}

impl GenerationGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        self.running.lock().remove(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_claim_is_refused_until_release() {
        let registry = GenerationRegistry::new();
        let guard = registry.try_begin("s1").unwrap();
        assert!(registry.state("s1").is_generating());
        assert!(registry.try_begin("s1").is_none());

        drop(guard);
        assert!(!registry.state("s1").is_generating());
        assert!(registry.try_begin("s1").is_some());
    }

    #[test]
    fn test_sessions_are_guarded_independently() {
        let registry = GenerationRegistry::new();
        let _a = registry.try_begin("a").unwrap();
        assert!(registry.try_begin("b").is_some());
    }

    #[test]
    fn test_cancel_reaches_guard_token() {
        let registry = GenerationRegistry::new();
        assert!(!registry.cancel("s"));

        let guard = registry.try_begin("s").unwrap();
        assert!(!guard.token().is_cancelled());
        assert!(registry.cancel("s"));
        assert!(guard.token().is_cancelled());
    }

    #[test]
    fn test_claims_race_to_exactly_one_winner() {
        let registry = GenerationRegistry::new();
        let winners: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let registry = registry.clone();
                    scope.spawn(move || registry.try_begin("shared"))
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().ok().flatten())
                .collect()
        });
        assert_eq!(winners.len(), 1);
    }
}
