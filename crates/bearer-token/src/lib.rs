//! Bearer token decoding, expiry checks, and expiry-warning scheduling.
//!
//! The token is opaque everywhere else in the client; this crate is the
//! only place that looks inside it. The policy is fail-closed: a token
//! that cannot be decoded, or that carries no expiration claim, is
//! treated as expired rather than silently trusted.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// How far ahead of expiry the warning fires.
pub const EXPIRY_WARNING_LEAD: Duration = Duration::from_secs(5 * 60);

/// Claims carried in the token payload. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject (user id).
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    /// Expiration, epoch seconds.
    #[serde(default)]
    pub exp: Option<i64>,
    /// Issued-at, epoch seconds.
    #[serde(default)]
    pub iat: Option<i64>,
}

/// Error type for token decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    /// The token does not have the expected structure.
    #[error("Malformed token: {0}")]
    Malformed(String),
}

/// Result type for token operations.
pub type TokenResult<T> = Result<T, TokenError>;

/// Decode the claims from a token's payload segment.
///
/// Fails with [`TokenError::Malformed`] when the token is not three
/// dot-separated segments, the payload is not valid base64url, or the
/// decoded payload is not valid JSON. Signature verification is the
/// server's job; the client only reads the self-describing claims.
pub fn decode(token: &str) -> TokenResult<TokenClaims> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(TokenError::Malformed(format!(
            "expected 3 segments, got {}",
            segments.len()
        )));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(segments[1])
        .map_err(|e| TokenError::Malformed(format!("payload is not base64url: {}", e)))?;

    serde_json::from_slice(&payload)
        .map_err(|e| TokenError::Malformed(format!("payload is not valid JSON: {}", e)))
}

/// Fail-closed expiry check.
///
/// Returns true when the token cannot be decoded, carries no `exp`
/// claim, or its `exp` is at or before `now_epoch_seconds`.
pub fn is_expired(token: &str, now_epoch_seconds: i64) -> bool {
    match decode(token) {
        Ok(claims) => match claims.exp {
            Some(exp) => exp <= now_epoch_seconds,
            None => true,
        },
        Err(_) => true,
    }
}

/// Time left until the token expires, or `None` when the token is
/// already expired or undecodable.
pub fn remaining(token: &str, now_epoch_seconds: i64) -> Option<Duration> {
    let claims = decode(token).ok()?;
    let exp = claims.exp?;
    if exp <= now_epoch_seconds {
        return None;
    }
    Some(Duration::from_secs((exp - now_epoch_seconds) as u64))
}

/// Handle for a scheduled expiry warning.
///
/// Dropping the handle (or calling [`ExpiryWarning::cancel`]) guarantees
/// the warning callback will not subsequently fire.
pub struct ExpiryWarning {
    handle: tokio::task::JoinHandle<()>,
}

impl ExpiryWarning {
    /// Cancel the pending warning.
    pub fn cancel(self) {
        // Drop aborts the task.
    }
}

impl Drop for ExpiryWarning {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Arrange for `on_warn` to be invoked exactly once, [`EXPIRY_WARNING_LEAD`]
/// before the token expires.
///
/// Returns `None` (nothing scheduled) when the token is already expired,
/// undecodable, or has less than the lead time remaining. Must be called
/// from within a tokio runtime.
pub fn schedule_expiry_warning<F>(token: &str, on_warn: F) -> Option<ExpiryWarning>
where
    F: FnOnce() + Send + 'static,
{
    let now = Utc::now().timestamp();
    let left = remaining(token, now)?;
    if left <= EXPIRY_WARNING_LEAD {
        debug!(
            remaining_secs = left.as_secs(),
            "Token too close to expiry, not scheduling warning"
        );
        return None;
    }

    let delay = left - EXPIRY_WARNING_LEAD;
    debug!(delay_secs = delay.as_secs(), "Expiry warning scheduled");
    // The deadline is fixed here, at schedule time; a timer created
    // inside the task would not start until the task is first polled.
    let sleep = tokio::time::sleep(delay);
    let handle = tokio::spawn(async move {
        sleep.await;
        on_warn();
    });
    Some(ExpiryWarning { handle })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Mint an unsigned test token with the given payload.
    fn make_token(payload: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("{}.{}.sig", header, body)
    }

    fn token_expiring_in(secs: i64) -> (String, i64) {
        let now = Utc::now().timestamp();
        let token = make_token(json!({"sub": "u-1", "exp": now + secs}));
        (token, now)
    }

    // =========================================================================
    // decode tests
    // =========================================================================

    #[test]
    fn decode_valid_token() {
        let token = make_token(json!({
            "sub": "u-1",
            "email": "amina@example.com",
            "role": "citizen",
            "exp": 1_900_000_000i64,
            "iat": 1_899_996_400i64,
        }));
        let claims = decode(&token).unwrap();
        assert_eq!(claims.sub.as_deref(), Some("u-1"));
        assert_eq!(claims.email.as_deref(), Some("amina@example.com"));
        assert_eq!(claims.role.as_deref(), Some("citizen"));
        assert_eq!(claims.exp, Some(1_900_000_000));
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let token = make_token(json!({"sub": "u-1", "exp": 1, "ward": "w-3"}));
        assert!(decode(&token).is_ok());
    }

    #[test]
    fn decode_rejects_wrong_segment_count() {
        assert!(matches!(decode("just-one"), Err(TokenError::Malformed(_))));
        assert!(matches!(decode("a.b"), Err(TokenError::Malformed(_))));
        assert!(matches!(decode("a.b.c.d"), Err(TokenError::Malformed(_))));
    }

    #[test]
    fn decode_rejects_bad_base64_payload() {
        assert!(matches!(
            decode("head.???.sig"),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    fn decode_rejects_non_json_payload() {
        let payload = URL_SAFE_NO_PAD.encode("not json at all");
        let token = format!("head.{}.sig", payload);
        assert!(matches!(decode(&token), Err(TokenError::Malformed(_))));
    }

    // =========================================================================
    // is_expired tests (fail-closed)
    // =========================================================================

    #[test]
    fn expired_when_undecodable() {
        assert!(is_expired("garbage", 0));
        assert!(is_expired("", 0));
    }

    #[test]
    fn expired_when_exp_claim_missing() {
        let token = make_token(json!({"sub": "u-1"}));
        assert!(is_expired(&token, 0));
    }

    #[test]
    fn expired_at_exact_boundary() {
        let token = make_token(json!({"exp": 1000}));
        assert!(is_expired(&token, 1000));
        assert!(is_expired(&token, 1001));
        assert!(!is_expired(&token, 999));
    }

    #[test]
    fn not_expired_with_future_exp() {
        let (token, now) = token_expiring_in(600);
        assert!(!is_expired(&token, now));
    }

    // =========================================================================
    // remaining tests
    // =========================================================================

    #[test]
    fn remaining_for_valid_token() {
        let token = make_token(json!({"exp": 1600}));
        assert_eq!(remaining(&token, 1000), Some(Duration::from_secs(600)));
    }

    #[test]
    fn remaining_none_when_expired_or_bad() {
        let token = make_token(json!({"exp": 1000}));
        assert_eq!(remaining(&token, 1000), None);
        assert_eq!(remaining("garbage", 0), None);
        assert_eq!(remaining(&make_token(json!({})), 0), None);
    }

    // =========================================================================
    // expiry warning tests
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn warning_fires_exactly_once_at_lead_time() {
        let (token, _) = token_expiring_in(600);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        let warning = schedule_expiry_warning(&token, move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(warning.is_some());
        let _warning = warning.unwrap();

        // 10-minute token, 5-minute lead: the deadline counts from the
        // moment of scheduling, not from the task's first poll.
        tokio::time::advance(Duration::from_secs(299)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Never fires again.
        tokio::time::advance(Duration::from_secs(3600)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_warning_for_near_expiry_token() {
        let (token, _) = token_expiring_in(120);
        let warning = schedule_expiry_warning(&token, || panic!("must not fire"));
        assert!(warning.is_none());
    }

    #[tokio::test]
    async fn no_warning_for_expired_or_bad_token() {
        assert!(schedule_expiry_warning("garbage", || {}).is_none());
        let (token, _) = token_expiring_in(-10);
        assert!(schedule_expiry_warning(&token, || {}).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_warning() {
        let (token, _) = token_expiring_in(600);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        let warning = schedule_expiry_warning(&token, move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        warning.cancel();

        tokio::time::advance(Duration::from_secs(3600)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_prevents_warning() {
        let (token, _) = token_expiring_in(600);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        {
            let _warning = schedule_expiry_warning(&token, move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        tokio::time::advance(Duration::from_secs(3600)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
