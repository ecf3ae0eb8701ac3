//! Authentication collaborators.
//!
//! The notifier never authenticates by itself. It reads a bearer token from an
//! [`AuthProvider`] and reacts to login/logout through [`AuthContext`].

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Source of the current bearer credential.
pub trait AuthProvider: Send + Sync {
    /// Current bearer token, if any.
    fn token(&self) -> Option<String>;

    fn is_authenticated(&self) -> bool {
        self.token().is_some_and(|t| !t.trim().is_empty())
    }

    /// Stable identity of the authenticated user, used to scope persisted state.
    fn identity(&self) -> Option<String> {
        None
    }
}

/// A fixed token, e.g. from the command line.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl AuthProvider for StaticToken {
    fn token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Stored session data
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuthSession {
    pub user_id: String,
    pub token: String,
}

/// Authentication context shared with the rest of the application.
///
/// Cloning shares the same session; every clone observes login/logout.
#[derive(Clone, Debug)]
pub struct AuthContext {
    session: watch::Sender<Option<AuthSession>>,
}

impl Default for AuthContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthContext {
    pub fn new() -> Self {
        let (session, _) = watch::channel(None);
        Self { session }
    }

    pub fn login(&self, user_id: impl Into<String>, token: impl Into<String>) {
        self.session.send_replace(Some(AuthSession {
            user_id: user_id.into(),
            token: token.into(),
        }));
    }

    /// Logout and clear session
    pub fn logout(&self) {
        self.session.send_replace(None);
    }

    /// Replace the token of the current session. No-op when logged out.
    pub fn refresh_token(&self, token: impl Into<String>) {
        let token = token.into();
        self.session.send_if_modified(|session| match session {
            Some(s) if s.token != token => {
                s.token = token;
                true
            }
            _ => false,
        });
    }

    pub fn current(&self) -> Option<AuthSession> {
        self.session.borrow().clone()
    }

    /// Receiver notified on every login, logout and token refresh.
    pub fn subscribe(&self) -> watch::Receiver<Option<AuthSession>> {
        self.session.subscribe()
    }

    /// Get the current user ID
    pub fn user_id(&self) -> Option<String> {
        self.session.borrow().as_ref().map(|s| s.user_id.clone())
    }
}

impl AuthProvider for AuthContext {
    fn token(&self) -> Option<String> {
        self.session.borrow().as_ref().map(|s| s.token.clone())
    }

    fn identity(&self) -> Option<String> {
        self.user_id()
    }
}
