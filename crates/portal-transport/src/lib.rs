//! Transport boundary for the civic portal client core.
//!
//! Every network round trip in the core goes through the [`Transport`]
//! trait, so the cache, session, and OTP crates stay free of HTTP
//! concerns and can be tested against scripted fakes. The production
//! implementation is [`HttpTransport`], built on `reqwest`.
//!
//! Failure contract: an HTTP-level failure (4xx/5xx) is an ordinary
//! [`ApiError::Http`] value, never a panic. Only the absence of an HTTP
//! response at all (connection refused, DNS failure, timeout) surfaces
//! as [`ApiError::Network`].

mod endpoint;
mod http;

pub use endpoint::{EndpointDescriptor, HttpMethod};
pub use http::HttpTransport;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Normalized transport failure surfaced to callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// The server responded with a non-success status code.
    #[error("HTTP {status_code}: {message}")]
    Http { status_code: u16, message: String },

    /// No HTTP response was received at all.
    #[error("Network error: {0}")]
    Network(String),
}

impl ApiError {
    /// The HTTP status code, if the server responded.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ApiError::Http { status_code, .. } => Some(*status_code),
            ApiError::Network(_) => None,
        }
    }

    /// True for a 401 response, the one signal that invalidates the
    /// current session.
    pub fn is_unauthorized(&self) -> bool {
        self.status_code() == Some(401)
    }

    /// True for a 403 response. Forbidden is surfaced to the caller but
    /// never clears credentials.
    pub fn is_forbidden(&self) -> bool {
        self.status_code() == Some(403)
    }
}

/// Result type for transport operations.
pub type TransportResult = Result<Value, ApiError>;

/// A single network collaborator the core depends on.
///
/// Implementations must not panic on HTTP failures; every outcome is a
/// value of [`TransportResult`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one request against the given endpoint.
    async fn send(&self, endpoint: &EndpointDescriptor, args: &Value) -> TransportResult;
}

/// Read-only supplier of the current bearer token.
///
/// The transport never owns session state; it asks a `TokenSource` for
/// the token to attach to each request.
pub trait TokenSource: Send + Sync {
    /// The bearer token to present, if any.
    fn current_token(&self) -> Option<String>;
}

/// A shared, writable token slot.
///
/// The session layer writes it on credential changes; the transport
/// reads it on every request. Breaks the construction cycle between
/// the two without either owning the other.
#[derive(Clone, Default)]
pub struct TokenCell {
    inner: Arc<Mutex<Option<String>>>,
}

impl TokenCell {
    /// Create an empty cell.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored token.
    pub fn set(&self, token: &str) {
        let mut slot = self.inner.lock().unwrap();
        *slot = Some(token.to_string());
    }

    /// Clear the stored token.
    pub fn clear(&self) {
        let mut slot = self.inner.lock().unwrap();
        *slot = None;
    }
}

impl TokenSource for TokenCell {
    fn current_token(&self) -> Option<String> {
        self.inner.lock().unwrap().clone()
    }
}
