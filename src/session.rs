//! Session state — the auth-cookie/session collaborator the token core
//! invalidates when a presented token fails validation.
//!
//! The broker never owns session storage; the embedding application does.
//! [`SessionStore`] is the narrow seam it calls through, injected explicitly
//! so tests can observe the logout side effect.

use parking_lot::RwLock;

/// Seam to the embedding application's session/cookie state.
pub trait SessionStore: Send + Sync {
    /// Invalidate the active session and any client-side auth state.
    fn clear(&self);

    /// Whether a session is currently active.
    fn is_active(&self) -> bool;
}

/// Single-slot in-memory session holding the current auth-cookie value, for
/// tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemorySession {
    token: RwLock<Option<String>>,
}

impl InMemorySession {
    /// Create a session already holding a token.
    #[must_use]
    pub fn active() -> Self {
        Self {
            token: RwLock::new(Some(String::new())),
        }
    }

    /// Store the auth-cookie value, activating the session.
    pub fn set(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    /// Current auth-cookie value, when a session is active.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }
}

impl SessionStore for InMemorySession {
    fn clear(&self) {
        *self.token.write() = None;
    }

    fn is_active(&self) -> bool {
        self.token.read().is_some()
    }
}
