//! Production HTTP transport over `reqwest`.

use crate::{ApiError, EndpointDescriptor, HttpMethod, TokenSource, TransportResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// HTTP transport backed by a shared `reqwest` client.
///
/// Attaches a bearer token from the configured [`TokenSource`] when one
/// is present. Non-2xx responses are mapped to [`ApiError::Http`] with
/// the server's `message` field when the body is parseable JSON, the
/// raw body otherwise.
#[derive(Clone)]
pub struct HttpTransport {
    http_client: reqwest::Client,
    base_url: String,
    token_source: Option<Arc<dyn TokenSource>>,
}

impl HttpTransport {
    /// Create a transport rooted at `base_url` (no trailing slash).
    pub fn new(base_url: impl Into<String>, token_source: Option<Arc<dyn TokenSource>>) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            base_url: base_url.into(),
            token_source,
        }
    }

    fn request_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Flatten a JSON object into query pairs for GET/DELETE requests.
    fn query_pairs(args: &Value) -> Vec<(String, String)> {
        match args {
            Value::Object(map) => map
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| {
                    let rendered = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), rendered)
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Pull a human-readable message out of an error response body.
    fn failure_message(body: &str) -> String {
        serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| {
                v.get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| body.to_string())
    }
}

#[async_trait]
impl crate::Transport for HttpTransport {
    async fn send(&self, endpoint: &EndpointDescriptor, args: &Value) -> TransportResult {
        let url = self.request_url(endpoint.path);
        debug!(endpoint = %endpoint, "Sending request");

        let mut request = match endpoint.method {
            HttpMethod::Get => self.http_client.get(&url).query(&Self::query_pairs(args)),
            HttpMethod::Delete => self
                .http_client
                .delete(&url)
                .query(&Self::query_pairs(args)),
            HttpMethod::Post => self.http_client.post(&url).json(args),
            HttpMethod::Put => self.http_client.put(&url).json(args),
            HttpMethod::Patch => self.http_client.patch(&url).json(args),
        };

        if let Some(source) = &self.token_source {
            if let Some(token) = source.current_token() {
                request = request.header("Authorization", format!("Bearer {}", token));
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = Self::failure_message(&body);
            warn!(endpoint = %endpoint, status = %status, "Request failed");
            return Err(ApiError::Http {
                status_code: status.as_u16(),
                message,
            });
        }

        let data = response
            .json::<Value>()
            .await
            .map_err(|e| ApiError::Network(format!("Invalid response body: {}", e)))?;
        Ok(data)
    }
}
