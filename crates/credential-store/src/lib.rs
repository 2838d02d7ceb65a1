//! Durable client storage for the portal's bearer token.
//!
//! The core persists exactly one value: the opaque bearer token under a
//! single well-known key. The [`CredentialStorage`] trait is the
//! boundary to whatever profile storage the embedding shell provides;
//! [`MemoryStorage`] is the built-in fallback (and the test double).

mod keys;
mod memory;
mod traits;

pub use keys::StorageKeys;
pub use memory::MemoryStorage;
pub use traits::CredentialStorage;

use thiserror::Error;

/// Error type for storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend-specific storage error
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_roundtrip() {
        let storage = MemoryStorage::new();

        storage.set(StorageKeys::AUTH_TOKEN, "tok-123").unwrap();
        assert_eq!(
            storage.get(StorageKeys::AUTH_TOKEN).unwrap(),
            Some("tok-123".to_string())
        );
        assert!(storage.has(StorageKeys::AUTH_TOKEN).unwrap());

        assert!(storage.remove(StorageKeys::AUTH_TOKEN).unwrap());
        assert!(!storage.remove(StorageKeys::AUTH_TOKEN).unwrap());
        assert_eq!(storage.get(StorageKeys::AUTH_TOKEN).unwrap(), None);
    }

    #[test]
    fn get_missing_key_returns_none() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get("nope").unwrap(), None);
        assert!(!storage.has("nope").unwrap());
    }

    #[test]
    fn set_overwrites() {
        let storage = MemoryStorage::new();
        storage.set("k", "first").unwrap();
        storage.set("k", "second").unwrap();
        assert_eq!(storage.get("k").unwrap(), Some("second".to_string()));
    }
}
