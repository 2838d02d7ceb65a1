//! Client-side query cache for the civic portal.
//!
//! Caches read-endpoint results keyed by endpoint name plus arguments,
//! indexes them by invalidation tags, coalesces duplicate in-flight
//! requests, and applies optimistic patches for mutations with ordered
//! rollback.

mod endpoint;
mod entry;
mod optimistic;
mod store;

pub use endpoint::{EndpointRegistry, MutationEndpoint, QueryEndpoint, TagsFn, DEFAULT_KEEP_ALIVE};
pub use entry::{CacheKey, EntryStatus, QuerySnapshot, Tag};
pub use optimistic::{OptimisticCoordinator, UndoToken};
pub use store::{CacheEvent, CacheStore, UnauthorizedCallback};

use portal_transport::ApiError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("no cache entry for {0}")]
    EntryMissing(CacheKey),

    #[error("cache entry {0} has no data to patch")]
    EmptyEntry(CacheKey),

    #[error(transparent)]
    Api(#[from] ApiError),
}

pub type CacheResult<T> = Result<T, CacheError>;
