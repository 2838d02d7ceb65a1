//! The portal's cacheable endpoints and their tag wiring.

use portal_transport::{EndpointDescriptor, HttpMethod};
use query_cache::{EndpointRegistry, MutationEndpoint, QueryEndpoint, Tag};
use serde_json::Value;
use std::time::Duration;

/// Tag kind for everything derived from the signed-in identity.
pub const SESSION_KIND: &str = "session";

/// Tag kind for complaints.
pub const COMPLAINT_KIND: &str = "complaint";

fn session_tags(_: &Value) -> Vec<Tag> {
    vec![Tag::kind(SESSION_KIND)]
}

fn complaint_entity_tags(args: &Value) -> Vec<Tag> {
    let id = args["id"].as_str().unwrap_or_default().to_string();
    vec![Tag::entity(COMPLAINT_KIND, id)]
}

fn complaint_kind_tags(_: &Value) -> Vec<Tag> {
    vec![Tag::kind(COMPLAINT_KIND)]
}

/// Build the registry the cache store runs against.
///
/// The current-user entry is cached for the whole session; it only
/// moves on an explicit session-tag invalidation (login, logout,
/// profile update), never on a timer.
pub fn portal_registry() -> EndpointRegistry {
    EndpointRegistry::new()
        .register_query(
            QueryEndpoint::new(
                "current-user",
                EndpointDescriptor::new(HttpMethod::Get, "/users/me"),
                session_tags,
            )
            .keep_alive(Duration::from_secs(24 * 3600)),
        )
        .register_query(QueryEndpoint::new(
            "complaint",
            EndpointDescriptor::new(HttpMethod::Get, "/complaints/detail"),
            complaint_entity_tags,
        ))
        .register_query(QueryEndpoint::new(
            "complaint-list",
            EndpointDescriptor::new(HttpMethod::Get, "/complaints"),
            complaint_kind_tags,
        ))
        .register_mutation(MutationEndpoint::new(
            "update-profile",
            EndpointDescriptor::new(HttpMethod::Patch, "/users/me"),
            session_tags,
        ))
        .register_mutation(MutationEndpoint::new(
            "submit-complaint",
            EndpointDescriptor::new(HttpMethod::Post, "/complaints"),
            complaint_kind_tags,
        ))
        .register_mutation(MutationEndpoint::new(
            "update-complaint",
            EndpointDescriptor::new(HttpMethod::Patch, "/complaints/detail"),
            complaint_entity_tags,
        ))
}
