//! Session lifecycle for the civic portal client.
//!
//! One [`SessionController`] owns the authenticated identity: it
//! validates and persists the bearer token, restores it on startup,
//! keeps the transport's token cell in sync, and notifies the shell of
//! every state change through a registered callback.
//!
//! Credential writes are fail-closed: a token that does not decode, is
//! already expired, or cannot be persisted never becomes the active
//! session. Clearing credentials is the opposite, it always succeeds in
//! memory even when the storage backend misbehaves.

use bearer_token::TokenError;
use chrono::Utc;
use credential_store::{CredentialStorage, StorageError, StorageKeys};
use portal_transport::TokenCell;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("token rejected: {0}")]
    Token(#[from] TokenError),

    #[error("token is already expired")]
    ExpiredToken,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// The signed-in user, as reported by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    /// Ward the user belongs to, when assigned.
    #[serde(default)]
    pub ward_id: Option<String>,
    /// Whether the account has a password set. Accounts created through
    /// OTP-only flows start without one.
    #[serde(default)]
    pub has_password: bool,
}

/// Active session: a validated token, plus the user record once the
/// server has confirmed it.
#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    pub token: String,
    pub user: Option<UserRecord>,
}

/// Notification emitted on every session state change.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// Fresh credentials were accepted (login or OTP verification).
    Authenticated,
    /// A persisted token was restored at startup.
    Restored,
    /// Credentials were cleared (logout or server 401).
    Cleared,
}

type SessionCallback = Box<dyn Fn(&SessionEvent) + Send + Sync>;
type ExpiryCallback = Arc<dyn Fn() + Send + Sync>;

/// Owns the session state and its persistence.
pub struct SessionController {
    storage: Arc<dyn CredentialStorage>,
    token_cell: TokenCell,
    session: Mutex<Option<Session>>,
    on_change: Mutex<Option<SessionCallback>>,
    on_expiry_soon: Mutex<Option<ExpiryCallback>>,
    expiry_warning: Mutex<Option<bearer_token::ExpiryWarning>>,
}

impl SessionController {
    pub fn new(storage: Arc<dyn CredentialStorage>, token_cell: TokenCell) -> Self {
        Self {
            storage,
            token_cell,
            session: Mutex::new(None),
            on_change: Mutex::new(None),
            on_expiry_soon: Mutex::new(None),
            expiry_warning: Mutex::new(None),
        }
    }

    /// Register the state-change callback. Replaces any previous one.
    pub fn set_on_change(&self, callback: SessionCallback) {
        let mut slot = self.on_change.lock().unwrap();
        *slot = Some(callback);
    }

    /// Register the near-expiry callback. Each installed token arms one
    /// warning that fires shortly before the token expires; replacing
    /// or clearing the session cancels it. Must be registered from
    /// within a tokio runtime context for the warning to be scheduled.
    pub fn set_on_expiry_soon(&self, callback: ExpiryCallback) {
        let mut slot = self.on_expiry_soon.lock().unwrap();
        *slot = Some(callback);
    }

    /// Install freshly issued credentials.
    ///
    /// Fail-closed: the token must decode and carry an unexpired `exp`,
    /// and it must persist to storage, before it becomes the active
    /// session. Any failure leaves the previous state untouched.
    pub fn set_credentials(
        &self,
        token: &str,
        user: Option<UserRecord>,
    ) -> SessionResult<()> {
        bearer_token::decode(token)?;
        if bearer_token::is_expired(token, Utc::now().timestamp()) {
            return Err(SessionError::ExpiredToken);
        }
        self.storage.set(StorageKeys::AUTH_TOKEN, token)?;

        self.token_cell.set(token);
        {
            let mut session = self.session.lock().unwrap();
            *session = Some(Session {
                token: token.to_string(),
                user,
            });
        }
        self.arm_expiry_warning(token);
        info!("Session authenticated");
        self.notify(SessionEvent::Authenticated);
        Ok(())
    }

    /// Drop the session everywhere. Idempotent and infallible: a storage
    /// failure is logged, never surfaced, and the in-memory state is
    /// cleared regardless.
    pub fn clear_credentials(&self) {
        if let Err(e) = self.storage.remove(StorageKeys::AUTH_TOKEN) {
            warn!(error = %e, "Failed to remove persisted token");
        }
        self.token_cell.clear();
        self.expiry_warning.lock().unwrap().take();

        let had_session = {
            let mut session = self.session.lock().unwrap();
            session.take().is_some()
        };
        if had_session {
            info!("Session cleared");
            self.notify(SessionEvent::Cleared);
        } else {
            debug!("Session already clear");
        }
    }

    /// Restore a persisted token at startup.
    ///
    /// Returns whether a session was restored. An expired or malformed
    /// stored token is purged and the client starts signed out. The user
    /// record is not persisted; callers attach it after confirming the
    /// token against the server.
    pub fn restore_from_storage(&self) -> SessionResult<bool> {
        let token = match self.storage.get(StorageKeys::AUTH_TOKEN)? {
            Some(token) => token,
            None => {
                debug!("No persisted session");
                return Ok(false);
            }
        };

        if bearer_token::is_expired(&token, Utc::now().timestamp()) {
            warn!("Persisted token is expired or unreadable, purging");
            if let Err(e) = self.storage.remove(StorageKeys::AUTH_TOKEN) {
                warn!(error = %e, "Failed to purge stale token");
            }
            return Ok(false);
        }

        self.token_cell.set(&token);
        self.arm_expiry_warning(&token);
        {
            let mut session = self.session.lock().unwrap();
            *session = Some(Session { token, user: None });
        }
        info!("Session restored from storage");
        self.notify(SessionEvent::Restored);
        Ok(true)
    }

    /// Attach the server-confirmed user record to the active session.
    /// Returns false when there is no session to attach to.
    pub fn attach_user(&self, user: UserRecord) -> bool {
        let mut session = self.session.lock().unwrap();
        match session.as_mut() {
            Some(session) => {
                debug!(user_id = %user.id, "User record attached");
                session.user = Some(user);
                true
            }
            None => false,
        }
    }

    /// True only when both a token and a server-confirmed user record
    /// are present. A session restored from storage stays unconfirmed,
    /// and route guards keep treating it as signed out, until
    /// [`SessionController::attach_user`] lands the record.
    pub fn is_authenticated(&self) -> bool {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|session| session.user.is_some())
    }

    pub fn current_session(&self) -> Option<Session> {
        self.session.lock().unwrap().clone()
    }

    pub fn current_token(&self) -> Option<String> {
        Some(self.session.lock().unwrap().as_ref()?.token.clone())
    }

    pub fn current_user(&self) -> Option<UserRecord> {
        self.session.lock().unwrap().as_ref()?.user.clone()
    }

    pub fn user_role(&self) -> Option<String> {
        self.current_user()?.role
    }

    /// Expiry check against the active token. No session counts as
    /// expired.
    pub fn is_token_expired(&self) -> bool {
        match self.session.lock().unwrap().as_ref() {
            Some(session) => bearer_token::is_expired(&session.token, Utc::now().timestamp()),
            None => true,
        }
    }

    fn notify(&self, event: SessionEvent) {
        let slot = self.on_change.lock().unwrap();
        if let Some(callback) = slot.as_ref() {
            callback(&event);
        }
    }

    /// Replace any pending warning with one for the new token. Without
    /// a registered callback nothing is scheduled.
    fn arm_expiry_warning(&self, token: &str) {
        let mut pending = self.expiry_warning.lock().unwrap();
        pending.take();

        let callback = {
            let slot = self.on_expiry_soon.lock().unwrap();
            slot.clone()
        };
        if let Some(callback) = callback {
            *pending = bearer_token::schedule_expiry_warning(token, move || callback());
        }
    }
}
