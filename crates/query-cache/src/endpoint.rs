//! Endpoint definitions and the registry.

use crate::entry::Tag;
use portal_transport::EndpointDescriptor;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Keep-alive window applied when an endpoint does not set its own.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Computes the tags an endpoint provides (queries) or invalidates
/// (mutations) from its arguments.
pub type TagsFn = fn(&Value) -> Vec<Tag>;

/// Definition of a cacheable read endpoint.
pub struct QueryEndpoint {
    pub name: &'static str,
    pub descriptor: EndpointDescriptor,
    /// How long a fulfilled result is served without a refetch.
    pub keep_alive: Duration,
    /// Tags the cached result is subscribed under.
    pub tags: TagsFn,
}

impl QueryEndpoint {
    pub fn new(name: &'static str, descriptor: EndpointDescriptor, tags: TagsFn) -> Self {
        Self {
            name,
            descriptor,
            keep_alive: DEFAULT_KEEP_ALIVE,
            tags,
        }
    }

    pub fn keep_alive(mut self, window: Duration) -> Self {
        self.keep_alive = window;
        self
    }
}

/// Definition of a write endpoint.
pub struct MutationEndpoint {
    pub name: &'static str,
    pub descriptor: EndpointDescriptor,
    /// Tags invalidated after the mutation succeeds.
    pub invalidates: TagsFn,
}

impl MutationEndpoint {
    pub fn new(name: &'static str, descriptor: EndpointDescriptor, invalidates: TagsFn) -> Self {
        Self {
            name,
            descriptor,
            invalidates,
        }
    }
}

/// All endpoints the store knows about, by name.
#[derive(Default)]
pub struct EndpointRegistry {
    queries: HashMap<&'static str, QueryEndpoint>,
    mutations: HashMap<&'static str, MutationEndpoint>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_query(mut self, endpoint: QueryEndpoint) -> Self {
        self.queries.insert(endpoint.name, endpoint);
        self
    }

    pub fn register_mutation(mut self, endpoint: MutationEndpoint) -> Self {
        self.mutations.insert(endpoint.name, endpoint);
        self
    }

    pub fn query(&self, name: &str) -> Option<&QueryEndpoint> {
        self.queries.get(name)
    }

    pub fn mutation(&self, name: &str) -> Option<&MutationEndpoint> {
        self.mutations.get(name)
    }

    /// Keep-alive for an endpoint, falling back to the default for
    /// entries whose definition has gone away.
    pub fn keep_alive_for(&self, name: &str) -> Duration {
        self.queries
            .get(name)
            .map(|q| q.keep_alive)
            .unwrap_or(DEFAULT_KEEP_ALIVE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal_transport::HttpMethod;

    fn no_tags(_: &Value) -> Vec<Tag> {
        Vec::new()
    }

    #[test]
    fn registry_lookup() {
        let registry = EndpointRegistry::new()
            .register_query(QueryEndpoint::new(
                "current-user",
                EndpointDescriptor::new(HttpMethod::Get, "/users/me"),
                no_tags,
            ))
            .register_mutation(MutationEndpoint::new(
                "update-profile",
                EndpointDescriptor::new(HttpMethod::Patch, "/users/me"),
                no_tags,
            ));

        assert!(registry.query("current-user").is_some());
        assert!(registry.query("update-profile").is_none());
        assert!(registry.mutation("update-profile").is_some());
        assert!(registry.mutation("current-user").is_none());
    }

    #[test]
    fn keep_alive_override_and_fallback() {
        let registry = EndpointRegistry::new().register_query(
            QueryEndpoint::new(
                "complaint-list",
                EndpointDescriptor::new(HttpMethod::Get, "/complaints"),
                no_tags,
            )
            .keep_alive(Duration::from_secs(5)),
        );

        assert_eq!(
            registry.keep_alive_for("complaint-list"),
            Duration::from_secs(5)
        );
        assert_eq!(registry.keep_alive_for("unknown"), DEFAULT_KEEP_ALIVE);
    }
}
