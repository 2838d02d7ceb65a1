//! The assembled portal client.
//!
//! [`PortalClient`] wires the transport, session, cache, and OTP flow
//! together:
//!
//! - the session writes the shared token cell the transport reads
//! - a 401 anywhere in the cache clears the session credentials
//! - verified OTP codes install credentials through the session
//! - login, logout, and profile changes invalidate the session tag so
//!   identity-derived queries refetch

use crate::config::PortalConfig;
use crate::endpoints::{portal_registry, SESSION_KIND};
use crate::ClientError;
use credential_store::CredentialStorage;
use otp_flow::{
    default_context_table, OtpContext, OtpFlowController, OtpState, TransportOtpOperations,
};
use portal_transport::{HttpTransport, TokenCell, Transport};
use query_cache::{
    CacheEvent, CacheKey, CacheStore, EntryStatus, OptimisticCoordinator, QuerySnapshot, Tag,
};
use serde_json::Value;
use session_engine::{SessionController, UserRecord};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub struct PortalClient {
    session: Arc<SessionController>,
    store: CacheStore,
    optimistic: OptimisticCoordinator,
    otp: Arc<OtpFlowController>,
}

impl PortalClient {
    /// Build a client over the real HTTP transport.
    pub fn new(
        config: &PortalConfig,
        storage: Arc<dyn CredentialStorage>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let token_cell = TokenCell::new();
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
            config.base_url.clone(),
            Some(Arc::new(token_cell.clone())),
        ));
        Ok(Self::wire(storage, transport, token_cell))
    }

    /// Build a client over an injected transport. Used by tests and by
    /// shells that bring their own networking.
    pub fn with_transport(
        storage: Arc<dyn CredentialStorage>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::wire(storage, transport, TokenCell::new())
    }

    fn wire(
        storage: Arc<dyn CredentialStorage>,
        transport: Arc<dyn Transport>,
        token_cell: TokenCell,
    ) -> Self {
        let session = Arc::new(SessionController::new(storage, token_cell));
        let store = CacheStore::new(transport.clone(), portal_registry());

        // The one place a server 401 feeds back into session state.
        let session_for_store = session.clone();
        store.set_unauthorized_callback(Box::new(move || {
            session_for_store.clear_credentials();
        }));

        let otp = Arc::new(OtpFlowController::new(
            Arc::new(TransportOtpOperations::new(transport)),
            session.clone(),
            default_context_table(),
        ));

        Self {
            optimistic: OptimisticCoordinator::new(store.clone()),
            session,
            store,
            otp,
        }
    }

    /// Restore a persisted session and confirm it against the server.
    ///
    /// Returns whether the client ends up signed in. A missing or
    /// expired stored token starts signed out without any network
    /// traffic; a token the server rejects is cleared through the 401
    /// callback during the current-user prime.
    pub async fn startup(&self) -> Result<bool, ClientError> {
        if !self.session.restore_from_storage()? {
            return Ok(false);
        }

        let snapshot = self.store.query("current-user", Value::Null).await?;
        if snapshot.status == EntryStatus::Fulfilled {
            if let Some(data) = &snapshot.data {
                match serde_json::from_value::<UserRecord>(data.clone()) {
                    Ok(user) => {
                        self.session.attach_user(user);
                    }
                    Err(e) => warn!(error = %e, "Unreadable current-user response"),
                }
            }
        }
        info!(signed_in = self.session.is_authenticated(), "Startup complete");
        Ok(self.session.is_authenticated())
    }

    // ===== Queries and mutations =====

    pub async fn query(&self, name: &str, args: Value) -> Result<QuerySnapshot, ClientError> {
        Ok(self.store.query(name, args).await?)
    }

    pub async fn mutate(&self, name: &str, args: Value) -> Result<Value, ClientError> {
        Ok(self.store.mutate(name, args).await?)
    }

    /// Mutation with an immediate local patch of one cached query,
    /// rolled back if the server refuses.
    pub async fn mutate_optimistic(
        &self,
        mutation: &str,
        args: Value,
        target_query: &str,
        target_args: &Value,
        patch: impl FnOnce(&mut Value),
    ) -> Result<Value, ClientError> {
        let key = CacheKey::new(target_query, target_args);
        Ok(self
            .optimistic
            .mutate_optimistic(mutation, args, &key, patch)
            .await?)
    }

    pub fn subscribe(&self, name: &str, args: &Value) -> Result<CacheKey, ClientError> {
        Ok(self.store.subscribe(name, args)?)
    }

    pub fn unsubscribe(&self, key: &CacheKey) {
        self.store.unsubscribe(key);
    }

    pub fn peek(&self, key: &CacheKey) -> Option<QuerySnapshot> {
        self.store.peek(key)
    }

    pub fn cache_changes(&self) -> broadcast::Receiver<CacheEvent> {
        self.store.changes()
    }

    /// Evict idle cache entries. Intended to run when the shell goes to
    /// the background or on a coarse timer.
    pub fn sweep_cache(&self) -> usize {
        self.store.sweep()
    }

    // ===== Verification flows =====

    pub async fn open_verification(
        &self,
        context: OtpContext,
        target: Value,
    ) -> Result<(), ClientError> {
        Ok(self.otp.open(context, target).await?)
    }

    pub async fn verify_code(&self, code: &str) -> Result<Value, ClientError> {
        let payload = self.otp.verify(code).await?;
        // New credentials may have been installed; identity-derived
        // queries must refetch.
        self.store.invalidate(&[Tag::kind(SESSION_KIND)]);
        Ok(payload)
    }

    pub async fn resend_code(&self) -> Result<(), ClientError> {
        Ok(self.otp.resend().await?)
    }

    pub fn cancel_verification(&self) {
        self.otp.cancel();
    }

    pub fn complete_verification(&self) -> Result<(), ClientError> {
        Ok(self.otp.complete()?)
    }

    pub fn verification_state(&self) -> OtpState {
        self.otp.state()
    }

    // ===== Session =====

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    pub fn current_user(&self) -> Option<UserRecord> {
        self.session.current_user()
    }

    pub fn user_role(&self) -> Option<String> {
        self.session.user_role()
    }

    pub fn is_token_expired(&self) -> bool {
        self.session.is_token_expired()
    }

    /// Direct access to the session controller, for shells that need to
    /// register a state-change callback.
    pub fn session(&self) -> &SessionController {
        &self.session
    }

    /// Register a callback fired shortly before the active token
    /// expires. Armed per installed token; cleared sessions cancel it.
    pub fn set_expiry_warning<F>(&self, on_warn: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.session.set_on_expiry_soon(Arc::new(on_warn));
    }

    /// Sign out: abandon any verification flow, drop credentials, and
    /// flush identity-derived cache entries.
    pub fn logout(&self) {
        self.otp.cancel();
        self.session.clear_credentials();
        self.store.invalidate(&[Tag::kind(SESSION_KIND)]);
    }
}
