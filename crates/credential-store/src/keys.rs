//! Well-known storage keys.

/// Namespace for the keys the portal persists.
pub struct StorageKeys;

impl StorageKeys {
    /// The bearer token. The only value the core persists.
    pub const AUTH_TOKEN: &'static str = "civic_portal.auth_token";
}
