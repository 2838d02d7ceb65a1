//! Storage trait definition.

use crate::StorageResult;

/// Trait for durable client storage backends.
///
/// Values must survive page reloads within the same browser profile;
/// beyond that, durability guarantees are the backend's business.
pub trait CredentialStorage: Send + Sync {
    /// Store a value
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Retrieve a value
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Delete a value. Returns true if the key existed.
    fn remove(&self, key: &str) -> StorageResult<bool>;

    /// Check if a key exists
    fn has(&self, key: &str) -> StorageResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}
