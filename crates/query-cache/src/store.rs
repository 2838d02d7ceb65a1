//! Tag-indexed store of query results and mutations.
//!
//! # Design Principles
//!
//! - Identical in-flight queries are coalesced into one network request
//! - A mutation's tag invalidation is applied before its result is
//!   handed back to the caller
//! - A rejected entry keeps its last fulfilled data next to the error
//! - A 401 from the transport is reported to the session layer exactly
//!   once per response, through a registered callback

use crate::endpoint::EndpointRegistry;
use crate::entry::{CacheEntry, CacheKey, EntryStatus, QuerySnapshot, Tag};
use crate::CacheError;
use chrono::Utc;
use portal_transport::Transport;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Notification emitted when an entry changes.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheEvent {
    /// An entry settled (fulfilled or rejected).
    Updated { key: CacheKey, status: EntryStatus },
    /// An entry was marked stale by tag invalidation.
    Invalidated { key: CacheKey },
}

/// Callback fired when the server answers 401.
pub type UnauthorizedCallback = Box<dyn Fn() + Send + Sync>;

struct StoreState {
    entries: HashMap<CacheKey, CacheEntry>,
    /// One broadcast sender per in-flight request; joiners subscribe.
    inflight: HashMap<CacheKey, broadcast::Sender<()>>,
    /// Monotonic fulfillment sequence.
    seq: u64,
}

struct Shared {
    transport: Arc<dyn Transport>,
    registry: EndpointRegistry,
    state: Mutex<StoreState>,
    events: broadcast::Sender<CacheEvent>,
    on_unauthorized: Mutex<Option<UnauthorizedCallback>>,
}

/// Cheaply cloneable handle over the shared cache.
#[derive(Clone)]
pub struct CacheStore {
    shared: Arc<Shared>,
}

enum Plan {
    Hit(QuerySnapshot),
    Join(broadcast::Receiver<()>),
    Fetch(broadcast::Receiver<()>),
}

/// Mark the entry pending and install the in-flight sender joiners
/// subscribe to. Caller must hold the state lock.
fn claim_fetch(state: &mut StoreState, key: &CacheKey) -> Plan {
    if let Some(entry) = state.entries.get_mut(key) {
        entry.status = EntryStatus::Pending;
    }
    let (tx, rx) = broadcast::channel(1);
    state.inflight.insert(key.clone(), tx);
    Plan::Fetch(rx)
}

impl CacheStore {
    pub fn new(transport: Arc<dyn Transport>, registry: EndpointRegistry) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                transport,
                registry,
                state: Mutex::new(StoreState {
                    entries: HashMap::new(),
                    inflight: HashMap::new(),
                    seq: 0,
                }),
                events,
                on_unauthorized: Mutex::new(None),
            }),
        }
    }

    /// Register the callback invoked whenever the transport answers 401.
    pub fn set_unauthorized_callback(&self, callback: UnauthorizedCallback) {
        let mut slot = self.shared.on_unauthorized.lock().unwrap();
        *slot = Some(callback);
    }

    /// Subscribe to entry change notifications.
    pub fn changes(&self) -> broadcast::Receiver<CacheEvent> {
        self.shared.events.subscribe()
    }

    /// Read the current state of an entry without triggering a fetch.
    pub fn peek(&self, key: &CacheKey) -> Option<QuerySnapshot> {
        let state = self.shared.state.lock().unwrap();
        state.entries.get(key).map(CacheEntry::snapshot)
    }

    /// Run (or join, or skip) a query.
    ///
    /// A fulfilled, unexpired, non-stale entry is returned without a
    /// network call. A request already in flight for the same key is
    /// joined rather than duplicated. Otherwise the entry goes pending
    /// and one transport call settles it. Rejection never drops the last
    /// fulfilled data.
    pub async fn query(&self, name: &str, args: Value) -> Result<QuerySnapshot, CacheError> {
        self.run_query(name, args, false).await
    }

    /// Force a refetch for an existing key, sharing in-flight dedup.
    pub async fn refetch(&self, key: CacheKey) -> Result<QuerySnapshot, CacheError> {
        let args = key.args_value();
        self.run_query(&key.endpoint, args, true).await
    }

    async fn run_query(
        &self,
        name: &str,
        args: Value,
        force: bool,
    ) -> Result<QuerySnapshot, CacheError> {
        let def = self
            .shared
            .registry
            .query(name)
            .ok_or_else(|| CacheError::UnknownEndpoint(name.to_string()))?;
        let key = CacheKey::new(name, &args);
        let descriptor = def.descriptor.clone();
        let keep_alive = def.keep_alive;
        let tags = (def.tags)(&args);

        // The fetch is claimed under the same lock that selects the
        // plan, so two callers can never both decide to fetch one key.
        let plan = {
            let mut state = self.shared.state.lock().unwrap();
            let entry = state
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(key.clone(), tags));

            let pending = entry.status == EntryStatus::Pending;
            let snapshot = if !force
                && entry.status == EntryStatus::Fulfilled
                && !entry.stale
                && entry.is_fresh(keep_alive, Utc::now())
            {
                Some(entry.snapshot())
            } else {
                None
            };

            if pending {
                match state.inflight.get(&key) {
                    Some(tx) => Plan::Join(tx.subscribe()),
                    None => claim_fetch(&mut state, &key),
                }
            } else if let Some(snapshot) = snapshot {
                Plan::Hit(snapshot)
            } else {
                claim_fetch(&mut state, &key)
            }
        };

        match plan {
            Plan::Hit(snapshot) => {
                debug!(key = %key, "Cache hit");
                Ok(snapshot)
            }
            Plan::Join(mut rx) => {
                debug!(key = %key, "Joining in-flight request");
                let _ = rx.recv().await;
                self.peek(&key).ok_or(CacheError::EntryMissing(key))
            }
            Plan::Fetch(mut rx) => {
                // The fetch runs detached, so a caller dropped mid-await
                // (timeout wrapper, navigation) cannot strand the key in
                // Pending with nothing left to settle it. The claimer
                // waits on the same channel as every joiner.
                let store = self.clone();
                let fetch_key = key.clone();
                tokio::spawn(async move {
                    store.fetch_and_settle(fetch_key, descriptor, args).await;
                });
                let _ = rx.recv().await;
                self.peek(&key).ok_or(CacheError::EntryMissing(key))
            }
        }
    }

    async fn fetch_and_settle(
        &self,
        key: CacheKey,
        descriptor: portal_transport::EndpointDescriptor,
        args: Value,
    ) {
        let result = self.shared.transport.send(&descriptor, &args).await;
        let unauthorized = matches!(&result, Err(e) if e.is_unauthorized());

        let (snapshot, waiters) = {
            let mut state = self.shared.state.lock().unwrap();
            state.seq += 1;
            let seq = state.seq;
            let now = Utc::now();

            let entry = state
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(key.clone(), Vec::new()));
            match result {
                Ok(data) => entry.fulfill(data, seq, now),
                Err(error) => {
                    warn!(key = %key, error = %error, "Query rejected");
                    entry.reject(error);
                }
            }
            let snapshot = entry.snapshot();
            let waiters = state.inflight.remove(&key);
            (snapshot, waiters)
        };

        // Session feedback first: waiters resuming with a 401 result
        // must find the credentials already cleared.
        if unauthorized {
            self.fire_unauthorized();
        }
        if let Some(tx) = waiters {
            let _ = tx.send(());
        }
        self.emit(CacheEvent::Updated {
            key,
            status: snapshot.status,
        });
    }

    /// Mark every entry whose tags intersect `tags` as stale. Entries
    /// with at least one subscriber are refetched immediately; the rest
    /// refetch on their next subscription or query.
    pub fn invalidate(&self, tags: &[Tag]) {
        let mut touched: Vec<CacheKey> = Vec::new();
        let mut to_refetch: Vec<CacheKey> = Vec::new();
        {
            let mut state = self.shared.state.lock().unwrap();
            for entry in state.entries.values_mut() {
                let hit = tags
                    .iter()
                    .any(|inv| entry.tags.iter().any(|prov| inv.matches(prov)));
                if !hit {
                    continue;
                }
                entry.stale = true;
                touched.push(entry.key.clone());
                if entry.subscriber_count > 0 && entry.status != EntryStatus::Pending {
                    to_refetch.push(entry.key.clone());
                }
            }
        }

        debug!(
            invalidated = touched.len(),
            refetching = to_refetch.len(),
            "Tags invalidated"
        );
        for key in touched {
            self.emit(CacheEvent::Invalidated { key });
        }
        for key in to_refetch {
            let store = self.clone();
            tokio::spawn(async move {
                if let Err(e) = store.refetch(key.clone()).await {
                    warn!(key = %key, error = %e, "Refetch after invalidation failed");
                }
            });
        }
    }

    /// Perform a mutation and, on success, invalidate its declared tags
    /// before the result reaches the caller.
    pub async fn mutate(&self, name: &str, args: Value) -> Result<Value, CacheError> {
        let def = self
            .shared
            .registry
            .mutation(name)
            .ok_or_else(|| CacheError::UnknownEndpoint(name.to_string()))?;
        debug!(mutation = name, "Running mutation");

        match self.shared.transport.send(&def.descriptor, &args).await {
            Ok(data) => {
                self.invalidate(&(def.invalidates)(&args));
                Ok(data)
            }
            Err(error) => {
                warn!(mutation = name, error = %error, "Mutation failed");
                if error.is_unauthorized() {
                    self.fire_unauthorized();
                }
                Err(CacheError::Api(error))
            }
        }
    }

    /// Register a subscriber for a query. Stale (or never-fetched)
    /// entries are refetched immediately.
    pub fn subscribe(&self, name: &str, args: &Value) -> Result<CacheKey, CacheError> {
        let def = self
            .shared
            .registry
            .query(name)
            .ok_or_else(|| CacheError::UnknownEndpoint(name.to_string()))?;
        let key = CacheKey::new(name, args);
        let tags = (def.tags)(args);

        let needs_fetch = {
            let mut state = self.shared.state.lock().unwrap();
            let entry = state
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(key.clone(), tags));
            entry.subscriber_count += 1;
            entry.released_at = None;
            entry.status != EntryStatus::Pending
                && (entry.stale || entry.status == EntryStatus::Uninitialized)
        };

        if needs_fetch {
            let store = self.clone();
            let key_clone = key.clone();
            tokio::spawn(async move {
                if let Err(e) = store.refetch(key_clone.clone()).await {
                    warn!(key = %key_clone, error = %e, "Fetch on subscribe failed");
                }
            });
        }
        Ok(key)
    }

    /// Drop one subscriber. The last unsubscribe starts the keep-alive
    /// eviction clock. Unknown keys are a no-op.
    pub fn unsubscribe(&self, key: &CacheKey) {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
            if entry.subscriber_count == 0 {
                entry.released_at = Some(Utc::now());
            }
        }
    }

    /// Evict zero-subscriber entries past their keep-alive window.
    /// Passive: callers decide when to sweep, there is no background
    /// task. Returns the number of evicted entries.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut state = self.shared.state.lock().unwrap();
        let registry = &self.shared.registry;
        let before = state.entries.len();
        state
            .entries
            .retain(|key, entry| !entry.is_evictable(registry.keep_alive_for(&key.endpoint), now));
        before - state.entries.len()
    }

    /// Number of entries currently held (diagnostics).
    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn with_entry_mut<T>(
        &self,
        key: &CacheKey,
        f: impl FnOnce(&mut CacheEntry) -> T,
    ) -> Option<T> {
        let mut state = self.shared.state.lock().unwrap();
        state.entries.get_mut(key).map(f)
    }

    pub(crate) fn emit(&self, event: CacheEvent) {
        // No receivers is fine.
        let _ = self.shared.events.send(event);
    }

    fn fire_unauthorized(&self) {
        warn!("Server answered 401, notifying session layer");
        let slot = self.shared.on_unauthorized.lock().unwrap();
        if let Some(callback) = slot.as_ref() {
            callback();
        }
    }
}
