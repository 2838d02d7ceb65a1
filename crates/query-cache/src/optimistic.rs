//! Optimistic writes against cached entries.
//!
//! An optimistic write patches the cached data immediately, then either
//! commits when the server accepts the mutation or rolls back when it
//! does not. The rollback is ordered against server data by the store's
//! fulfillment sequence: if a fetch settled the entry after the patch was
//! captured, the rollback is skipped so confirmed data is never clobbered
//! by an older snapshot.

use crate::entry::{CacheKey, EntryStatus};
use crate::store::{CacheEvent, CacheStore};
use crate::CacheError;
use serde_json::Value;
use tracing::{debug, warn};

/// Receipt for one applied optimistic patch.
///
/// Holds everything needed to restore the entry: the pre-patch data and
/// the fulfillment sequence observed at capture time. Consumed by exactly
/// one of [`OptimisticCoordinator::commit`] or
/// [`OptimisticCoordinator::rollback`].
#[derive(Debug)]
pub struct UndoToken {
    key: CacheKey,
    snapshot: Value,
    captured_seq: u64,
}

impl UndoToken {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

/// Applies, commits, and rolls back optimistic patches on a store.
#[derive(Clone)]
pub struct OptimisticCoordinator {
    store: CacheStore,
}

impl OptimisticCoordinator {
    pub fn new(store: CacheStore) -> Self {
        Self { store }
    }

    /// Patch the cached data for `key` in place and return an undo token.
    ///
    /// Fails when the entry does not exist or has never been fulfilled;
    /// there is nothing meaningful to patch or restore in either case.
    pub fn apply(
        &self,
        key: &CacheKey,
        patch: impl FnOnce(&mut Value),
    ) -> Result<UndoToken, CacheError> {
        let token = self
            .store
            .with_entry_mut(key, |entry| {
                let data = match entry.data.as_mut() {
                    Some(data) => data,
                    None => return Err(CacheError::EmptyEntry(key.clone())),
                };
                let snapshot = data.clone();
                let captured_seq = entry.fulfilled_seq;
                patch(data);
                Ok(UndoToken {
                    key: key.clone(),
                    snapshot,
                    captured_seq,
                })
            })
            .ok_or_else(|| CacheError::EntryMissing(key.clone()))??;

        debug!(key = %token.key, seq = token.captured_seq, "Optimistic patch applied");
        self.store.emit(CacheEvent::Updated {
            key: token.key.clone(),
            status: EntryStatus::Fulfilled,
        });
        Ok(token)
    }

    /// The server accepted the mutation; the patched data stands until
    /// tag invalidation replaces it with the confirmed result.
    pub fn commit(&self, token: UndoToken) {
        debug!(key = %token.key, "Optimistic patch committed");
    }

    /// Restore the pre-patch data, unless a fetch settled the entry after
    /// the patch was captured. Returns whether the restore happened.
    pub fn rollback(&self, token: UndoToken) -> bool {
        let restored = self
            .store
            .with_entry_mut(&token.key, |entry| {
                if entry.fulfilled_seq > token.captured_seq {
                    debug!(
                        key = %token.key,
                        captured = token.captured_seq,
                        current = entry.fulfilled_seq,
                        "Rollback skipped, entry refreshed since capture"
                    );
                    return false;
                }
                entry.data = Some(token.snapshot);
                true
            })
            .unwrap_or(false);

        if restored {
            warn!(key = %token.key, "Optimistic patch rolled back");
            self.store.emit(CacheEvent::Updated {
                key: token.key,
                status: EntryStatus::Fulfilled,
            });
        }
        restored
    }

    /// Full optimistic mutation: patch the target entry, run the
    /// mutation, then commit or roll back based on the outcome.
    ///
    /// A target entry that cannot be patched (missing or never fulfilled)
    /// does not block the mutation; it just runs without the optimism.
    pub async fn mutate_optimistic(
        &self,
        mutation: &str,
        mutation_args: Value,
        target: &CacheKey,
        patch: impl FnOnce(&mut Value),
    ) -> Result<Value, CacheError> {
        let token = match self.apply(target, patch) {
            Ok(token) => Some(token),
            Err(e) => {
                debug!(key = %target, error = %e, "Skipping optimistic patch");
                None
            }
        };

        match self.store.mutate(mutation, mutation_args).await {
            Ok(data) => {
                if let Some(token) = token {
                    self.commit(token);
                }
                Ok(data)
            }
            Err(error) => {
                if let Some(token) = token {
                    self.rollback(token);
                }
                Err(error)
            }
        }
    }
}
