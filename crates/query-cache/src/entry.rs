//! Cache entries, keys, and invalidation tags.

use chrono::{DateTime, Utc};
use portal_transport::ApiError;
use serde_json::Value;
use std::time::Duration;

/// Invalidation tag: an entity kind, optionally narrowed to one entity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Tag {
    kind: String,
    id: Option<String>,
}

impl Tag {
    /// Tag covering every entity of a kind.
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
        }
    }

    /// Tag covering one specific entity.
    pub fn entity(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: Some(id.into()),
        }
    }

    /// Whether an invalidated tag reaches a provided tag.
    ///
    /// Kinds must match; a tag without an id covers every id of its kind,
    /// on either side.
    pub fn matches(&self, provided: &Tag) -> bool {
        if self.kind != provided.kind {
            return false;
        }
        match (&self.id, &provided.id) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// Unique identity of a cache entry: endpoint name plus canonically
/// serialized arguments.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub endpoint: String,
    pub args: String,
}

impl CacheKey {
    pub fn new(endpoint: &str, args: &Value) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            args: args.to_string(),
        }
    }

    /// Parse the serialized arguments back into a value (for refetches).
    pub fn args_value(&self) -> Value {
        serde_json::from_str(&self.args).unwrap_or(Value::Null)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.endpoint, self.args)
    }
}

/// Lifecycle status of a cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryStatus {
    Uninitialized,
    Pending,
    Fulfilled,
    Rejected,
}

/// One cached query result.
///
/// `tags` are computed once from the endpoint definition at creation and
/// never change afterward. A rejected entry keeps its last fulfilled
/// `data` next to the error so readers can show stale-but-valid data
/// instead of blanking out.
#[derive(Debug)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub tags: Vec<Tag>,
    pub data: Option<Value>,
    pub error: Option<ApiError>,
    pub status: EntryStatus,
    pub subscriber_count: usize,
    /// Marked by invalidation; a stale entry is refetched instead of hit.
    pub stale: bool,
    /// Monotonic store sequence stamped at fulfillment. Orders optimistic
    /// rollbacks against newer server-confirmed data.
    pub fulfilled_seq: u64,
    pub fulfilled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// When the last subscriber went away; starts the keep-alive clock.
    pub released_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn new(key: CacheKey, tags: Vec<Tag>) -> Self {
        Self {
            key,
            tags,
            data: None,
            error: None,
            status: EntryStatus::Uninitialized,
            subscriber_count: 0,
            stale: false,
            fulfilled_seq: 0,
            fulfilled_at: None,
            created_at: Utc::now(),
            released_at: None,
        }
    }

    /// Settle the entry with fresh server data.
    pub fn fulfill(&mut self, data: Value, seq: u64, at: DateTime<Utc>) {
        self.data = Some(data);
        self.error = None;
        self.status = EntryStatus::Fulfilled;
        self.stale = false;
        self.fulfilled_seq = seq;
        self.fulfilled_at = Some(at);
    }

    /// Settle the entry with a failure, keeping the last fulfilled data.
    pub fn reject(&mut self, error: ApiError) {
        self.error = Some(error);
        self.status = EntryStatus::Rejected;
    }

    /// True while the fulfilled data is within the keep-alive window.
    pub fn is_fresh(&self, keep_alive: Duration, now: DateTime<Utc>) -> bool {
        match self.fulfilled_at {
            Some(at) => {
                let age = now.signed_duration_since(at).to_std().unwrap_or_default();
                age < keep_alive
            }
            None => false,
        }
    }

    /// True when the entry has no subscribers and has sat past the
    /// keep-alive window since it was last released (or settled).
    pub fn is_evictable(&self, keep_alive: Duration, now: DateTime<Utc>) -> bool {
        if self.subscriber_count > 0 || self.status == EntryStatus::Pending {
            return false;
        }
        let basis = self
            .released_at
            .or(self.fulfilled_at)
            .unwrap_or(self.created_at);
        let idle = now.signed_duration_since(basis).to_std().unwrap_or_default();
        idle >= keep_alive
    }

    /// Clone-out view handed to callers.
    pub fn snapshot(&self) -> QuerySnapshot {
        QuerySnapshot {
            key: self.key.clone(),
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            stale: self.stale,
        }
    }
}

/// Caller-visible view of a cache entry.
#[derive(Clone, Debug, PartialEq)]
pub struct QuerySnapshot {
    pub key: CacheKey,
    pub status: EntryStatus,
    pub data: Option<Value>,
    pub error: Option<ApiError>,
    pub stale: bool,
}
