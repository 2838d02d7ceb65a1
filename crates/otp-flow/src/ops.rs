//! Network operations behind the OTP flow controller.

use crate::context::OtpContextSpec;
use async_trait::async_trait;
use portal_transport::{ApiError, Transport};
use serde_json::Value;
use session_engine::UserRecord;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A failed OTP network operation, with the HTTP status when the server
/// answered at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowError {
    pub message: String,
    pub status_code: Option<u16>,
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {code})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl From<ApiError> for FlowError {
    fn from(error: ApiError) -> Self {
        Self {
            status_code: error.status_code(),
            message: error.to_string(),
        }
    }
}

/// Result of a successful code verification.
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    /// Token and user record, present when the context issues
    /// credentials and the server included them.
    pub credentials: Option<(String, UserRecord)>,
    /// The full response body, for context-specific payloads such as a
    /// password-setup ticket or a created complaint.
    pub payload: Value,
}

/// The three network calls an OTP flow can make.
#[async_trait]
pub trait OtpOperations: Send + Sync {
    /// Ask the server to deliver a code to the target.
    async fn send_code(&self, spec: &OtpContextSpec, target: &Value) -> Result<Value, FlowError>;

    /// Present a code for verification.
    async fn verify_code(
        &self,
        spec: &OtpContextSpec,
        args: &Value,
    ) -> Result<VerifyOutcome, FlowError>;

    /// Ask the server to deliver a fresh code.
    async fn resend_code(&self, spec: &OtpContextSpec, target: &Value)
        -> Result<Value, FlowError>;
}

/// Production implementation over the portal transport.
pub struct TransportOtpOperations {
    transport: Arc<dyn Transport>,
}

impl TransportOtpOperations {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Pull credentials out of a verification response.
    ///
    /// Contexts that issue credentials must answer with a `token` and a
    /// `user` object; anything else is a malformed response, reported as
    /// a failure rather than a silent unauthenticated success.
    fn extract_credentials(
        spec: &OtpContextSpec,
        payload: &Value,
    ) -> Result<Option<(String, UserRecord)>, FlowError> {
        if !spec.issues_credentials {
            return Ok(None);
        }
        let token = payload["token"].as_str().ok_or_else(|| FlowError {
            message: "verification response is missing a token".to_string(),
            status_code: None,
        })?;
        let user: UserRecord =
            serde_json::from_value(payload["user"].clone()).map_err(|e| FlowError {
                message: format!("verification response has an invalid user record: {e}"),
                status_code: None,
            })?;
        Ok(Some((token.to_string(), user)))
    }
}

#[async_trait]
impl OtpOperations for TransportOtpOperations {
    async fn send_code(&self, spec: &OtpContextSpec, target: &Value) -> Result<Value, FlowError> {
        debug!(context = ?spec.context, "Sending verification code");
        Ok(self.transport.send(&spec.send, target).await?)
    }

    async fn verify_code(
        &self,
        spec: &OtpContextSpec,
        args: &Value,
    ) -> Result<VerifyOutcome, FlowError> {
        debug!(context = ?spec.context, "Verifying code");
        let payload = self.transport.send(&spec.verify, args).await?;
        let credentials = Self::extract_credentials(spec, &payload)?;
        Ok(VerifyOutcome {
            credentials,
            payload,
        })
    }

    async fn resend_code(
        &self,
        spec: &OtpContextSpec,
        target: &Value,
    ) -> Result<Value, FlowError> {
        debug!(context = ?spec.context, "Resending verification code");
        Ok(self.transport.send(&spec.resend, target).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{default_context_table, OtpContext};
    use serde_json::json;

    #[test]
    fn credential_extraction_requires_token_and_user() {
        let table = default_context_table();
        let login = &table[&OtpContext::Login];

        let good = json!({"token": "abc", "user": {"id": "u-1", "role": "citizen"}});
        let (token, user) = TransportOtpOperations::extract_credentials(login, &good)
            .unwrap()
            .unwrap();
        assert_eq!(token, "abc");
        assert_eq!(user.id, "u-1");

        let missing_token = json!({"user": {"id": "u-1"}});
        assert!(TransportOtpOperations::extract_credentials(login, &missing_token).is_err());

        let bad_user = json!({"token": "abc", "user": {"email": "no-id@example.org"}});
        assert!(TransportOtpOperations::extract_credentials(login, &bad_user).is_err());
    }

    #[test]
    fn password_setup_never_yields_credentials() {
        let table = default_context_table();
        let setup = &table[&OtpContext::PasswordSetup];

        let payload = json!({"token": "abc", "user": {"id": "u-1"}, "setup_ticket": "t-9"});
        let credentials =
            TransportOtpOperations::extract_credentials(setup, &payload).unwrap();
        assert!(credentials.is_none());
    }

    #[test]
    fn flow_error_carries_status_from_api_error() {
        let err = FlowError::from(ApiError::Http {
            status_code: 400,
            message: "invalid code".to_string(),
        });
        assert_eq!(err.status_code, Some(400));

        let network = FlowError::from(ApiError::Network("timeout".to_string()));
        assert_eq!(network.status_code, None);
    }
}
