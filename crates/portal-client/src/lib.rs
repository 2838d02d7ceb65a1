//! Civic portal client, assembled.
//!
//! This crate wires the lower layers into one [`PortalClient`]:
//! transport, bearer-token handling, credential storage, the query
//! cache, the session controller, and the OTP flows. Shells embed this
//! crate and talk to the facade only.

mod client;
mod config;
mod endpoints;
mod logging;

pub use client::PortalClient;
pub use config::{PortalConfig, DEFAULT_BASE_URL, DEFAULT_LOG_LEVEL};
pub use endpoints::{portal_registry, COMPLAINT_KIND, SESSION_KIND};
pub use logging::init_logging;

// Re-exported so shells depend on this crate alone.
pub use otp_flow::{OtpContext, OtpError, OtpState};
pub use query_cache::{CacheError, CacheEvent, CacheKey, EntryStatus, QuerySnapshot, Tag};
pub use session_engine::{SessionError, SessionEvent, UserRecord};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(#[from] url::ParseError),

    #[error("base URL must be http or https, got {0}")]
    UnsupportedScheme(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Otp(#[from] OtpError),
}
