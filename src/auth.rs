//! Bearer credential storage shared by stream sessions.
//!
//! The stream subsystem reads the token once per session and clears it when
//! the server closes with the unauthorized code. Everything else (login,
//! refresh) belongs to the embedding application.

use std::sync::RwLock;

use secrecy::SecretString;
use tokio::sync::watch;
use tracing::info;

/// Whether a credential is currently held.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuthState {
    Authenticated,
    SignedOut,
}

/// Holds a single opaque bearer token.
///
/// `clear` must be idempotent and safe to call from several sessions at once.
pub trait CredentialStore: Send + Sync {
    /// Returns the current token, if any.
    fn get(&self) -> Option<SecretString>;

    /// Replaces the current token.
    fn set(&self, token: SecretString);

    /// Drops the current token. Calling this on an empty store is a no-op.
    fn clear(&self);
}

/// In-process credential store with change notifications.
#[derive(Debug)]
pub struct MemoryCredentialStore {
    token: RwLock<Option<SecretString>>,
    state: watch::Sender<AuthState>,
}

impl MemoryCredentialStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (state, _) = watch::channel(AuthState::SignedOut);
        Self {
            token: RwLock::new(None),
            state,
        }
    }

    /// Creates a store already holding `token`.
    pub fn with_token(token: SecretString) -> Self {
        let store = Self::new();
        store.set(token);
        store
    }

    /// Current authentication state.
    pub fn auth_state(&self) -> AuthState {
        *self.state.borrow()
    }

    /// Subscribes to authentication state changes.
    ///
    /// Receivers are notified only on an actual transition, so a burst of
    /// redundant `clear` calls wakes them once.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Option<SecretString> {
        self.token.read().ok().and_then(|guard| guard.clone())
    }

    fn set(&self, token: SecretString) {
        if let Ok(mut guard) = self.token.write() {
            *guard = Some(token);
        }
        self.state.send_if_modified(|state| {
            let changed = *state != AuthState::Authenticated;
            *state = AuthState::Authenticated;
            changed
        });
    }

    fn clear(&self) {
        let had_token = match self.token.write() {
            Ok(mut guard) => guard.take().is_some(),
            Err(_) => false,
        };
        let notified = self.state.send_if_modified(|state| {
            let changed = *state != AuthState::SignedOut;
            *state = AuthState::SignedOut;
            changed
        });
        if had_token || notified {
            info!(event = "credential_cleared");
        }
    }
}
