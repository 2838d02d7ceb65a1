//! Client configuration.

use crate::ClientError;
use serde::{Deserialize, Serialize};
use url::Url;

/// Default portal API base URL (can be overridden at compile time via
/// the CIVIC_PORTAL_BASE_URL env var).
pub const DEFAULT_BASE_URL: &str = match option_env!("CIVIC_PORTAL_BASE_URL") {
    Some(url) => url,
    None => "https://portal.example.org/api",
};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Main client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    /// Portal API base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl PortalConfig {
    /// Create a config with default values, then override from the
    /// environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) {
        if let Ok(base_url) = std::env::var("CIVIC_PORTAL_BASE_URL") {
            if !base_url.trim().is_empty() {
                self.base_url = base_url;
            }
        }
        if let Ok(log_level) = std::env::var("CIVIC_PORTAL_LOG_LEVEL") {
            if !log_level.trim().is_empty() {
                self.log_level = log_level;
            }
        }
    }

    /// Check the base URL parses and uses an HTTP scheme.
    pub fn validate(&self) -> Result<(), ClientError> {
        let url = Url::parse(&self.base_url)?;
        match url.scheme() {
            "http" | "https" => Ok(()),
            scheme => Err(ClientError::UnsupportedScheme(scheme.to_string())),
        }
    }
}
