//! Endpoint descriptors.

use std::fmt;

/// HTTP method for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        };
        write!(f, "{}", name)
    }
}

/// Method and path of a single server endpoint.
///
/// Paths are relative to the transport's base URL. Arguments are carried
/// separately; GET and DELETE requests encode them as query parameters,
/// everything else as a JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub method: HttpMethod,
    pub path: &'static str,
}

impl EndpointDescriptor {
    pub const fn new(method: HttpMethod, path: &'static str) -> Self {
        Self { method, path }
    }

    /// True when arguments travel in the request body.
    pub fn has_body(&self) -> bool {
        !matches!(self.method, HttpMethod::Get | HttpMethod::Delete)
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_display() {
        let ep = EndpointDescriptor::new(HttpMethod::Post, "/auth/login/otp/verify");
        assert_eq!(ep.to_string(), "POST /auth/login/otp/verify");
    }

    #[test]
    fn body_methods() {
        assert!(!EndpointDescriptor::new(HttpMethod::Get, "/x").has_body());
        assert!(!EndpointDescriptor::new(HttpMethod::Delete, "/x").has_body());
        assert!(EndpointDescriptor::new(HttpMethod::Post, "/x").has_body());
        assert!(EndpointDescriptor::new(HttpMethod::Patch, "/x").has_body());
        assert!(EndpointDescriptor::new(HttpMethod::Put, "/x").has_body());
    }
}
