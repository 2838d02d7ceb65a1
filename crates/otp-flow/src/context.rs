//! Capability table for OTP contexts.
//!
//! Each place the portal asks for a one-time passcode is a context with
//! its own endpoint family and its own answer to "does a verified code
//! sign the user in". The table is data; the flow controller never
//! branches on the context itself.

use portal_transport::{EndpointDescriptor, HttpMethod};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The portal surfaces that require code verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpContext {
    /// Passwordless sign-in for an existing account.
    Login,
    /// Email confirmation during account creation.
    Registration,
    /// Email verification for a complaint filed without an account.
    GuestComplaint,
    /// Identity proof before setting a password on an existing account.
    PasswordSetup,
}

/// Everything the flow controller needs to know about one context.
#[derive(Debug, Clone)]
pub struct OtpContextSpec {
    pub context: OtpContext,
    pub send: EndpointDescriptor,
    pub verify: EndpointDescriptor,
    pub resend: EndpointDescriptor,
    /// Whether a successful verification carries session credentials.
    /// Password setup proves identity without signing the user in.
    pub issues_credentials: bool,
}

/// The portal's four OTP contexts, keyed for lookup by the controller.
pub fn default_context_table() -> HashMap<OtpContext, OtpContextSpec> {
    let mut table = HashMap::new();
    table.insert(
        OtpContext::Login,
        OtpContextSpec {
            context: OtpContext::Login,
            send: EndpointDescriptor::new(HttpMethod::Post, "/auth/login/otp/send"),
            verify: EndpointDescriptor::new(HttpMethod::Post, "/auth/login/otp/verify"),
            resend: EndpointDescriptor::new(HttpMethod::Post, "/auth/login/otp/resend"),
            issues_credentials: true,
        },
    );
    table.insert(
        OtpContext::Registration,
        OtpContextSpec {
            context: OtpContext::Registration,
            send: EndpointDescriptor::new(HttpMethod::Post, "/auth/register/otp/send"),
            verify: EndpointDescriptor::new(HttpMethod::Post, "/auth/register/otp/verify"),
            resend: EndpointDescriptor::new(HttpMethod::Post, "/auth/register/otp/resend"),
            issues_credentials: true,
        },
    );
    table.insert(
        OtpContext::GuestComplaint,
        OtpContextSpec {
            context: OtpContext::GuestComplaint,
            send: EndpointDescriptor::new(HttpMethod::Post, "/complaints/guest/otp/send"),
            verify: EndpointDescriptor::new(HttpMethod::Post, "/complaints/guest/otp/verify"),
            resend: EndpointDescriptor::new(HttpMethod::Post, "/complaints/guest/otp/resend"),
            issues_credentials: true,
        },
    );
    table.insert(
        OtpContext::PasswordSetup,
        OtpContextSpec {
            context: OtpContext::PasswordSetup,
            send: EndpointDescriptor::new(HttpMethod::Post, "/auth/password/otp/send"),
            verify: EndpointDescriptor::new(HttpMethod::Post, "/auth/password/otp/verify"),
            resend: EndpointDescriptor::new(HttpMethod::Post, "/auth/password/otp/resend"),
            issues_credentials: false,
        },
    );
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_covers_every_context() {
        let table = default_context_table();
        assert_eq!(table.len(), 4);
        for context in [
            OtpContext::Login,
            OtpContext::Registration,
            OtpContext::GuestComplaint,
            OtpContext::PasswordSetup,
        ] {
            let spec = table.get(&context).unwrap();
            assert_eq!(spec.context, context);
            assert_eq!(spec.send.method, HttpMethod::Post);
        }
    }

    #[test]
    fn only_password_setup_withholds_credentials() {
        let table = default_context_table();
        assert!(table[&OtpContext::Login].issues_credentials);
        assert!(table[&OtpContext::Registration].issues_credentials);
        assert!(table[&OtpContext::GuestComplaint].issues_credentials);
        assert!(!table[&OtpContext::PasswordSetup].issues_credentials);
    }
}
